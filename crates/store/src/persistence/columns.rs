//! Closed column sets and partial updates
//!
//! Every updatable entity kind has an enum naming exactly the columns that may
//! be assigned. [`Updates`] collects assignments for one kind; the only text
//! interpolated into an UPDATE statement is the `&'static str` name of one of
//! these variants, never caller input.

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// SQL type of a column, used to check values before any statement is issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    /// 32-bit integer (`INTEGER`)
    Integer,
    /// 64-bit integer (`BIGINT`)
    BigInt,
    Text,
    Boolean,
    /// Byte sequence (`BYTEA`)
    Bytes,
    /// JSON document stored as its canonical `TEXT` encoding
    Json,
}

/// A column that can appear on the left side of an assignment
pub trait Column:
    Copy + Eq + fmt::Debug + FromStr<Err = StoreError> + Send + Sync + 'static
{
    /// Table (and entity kind) the column belongs to
    const ENTITY: &'static str;

    /// Column name as it appears in the schema
    fn name(self) -> &'static str;

    fn sql_type(self) -> SqlType;

    fn nullable(self) -> bool;

    /// Every assignable column of this entity kind
    fn all() -> &'static [Self];
}

macro_rules! columns {
    (
        $(#[$meta:meta])*
        $name:ident for $entity:literal {
            $($variant:ident => $column:literal : $ty:ident $(, $nullable:ident)?;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl Column for $name {
            const ENTITY: &'static str = $entity;

            fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $column,)+
                }
            }

            fn sql_type(self) -> SqlType {
                match self {
                    $(Self::$variant => SqlType::$ty,)+
                }
            }

            fn nullable(self) -> bool {
                match self {
                    $(Self::$variant => columns!(@nullable $($nullable)?),)+
                }
            }

            fn all() -> &'static [Self] {
                &[$(Self::$variant,)+]
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($column => Ok(Self::$variant),)+
                    "id" => Err(StoreError::InvalidColumn {
                        entity: $entity,
                        reason: "the row identifier cannot be assigned".to_string(),
                    }),
                    other => Err(StoreError::InvalidColumn {
                        entity: $entity,
                        reason: format!("unknown column '{}'", other),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
    (@nullable nullable) => { true };
    (@nullable) => { false };
}

columns! {
    /// Assignable workflow columns
    WorkflowColumn for "workflow" {
        Name => "name": Text;
        Params => "params": Json;
        Status => "status": Integer;
        Type => "type": Text;
        StartTime => "start_time": BigInt, nullable;
        EndTime => "end_time": BigInt, nullable;
    }
}

columns! {
    /// Assignable step columns
    StepColumn for "step" {
        Name => "name": Text;
        Workflow => "workflow": BigInt;
        Status => "status": Integer;
        Type => "type": Text;
        Params => "params": Json;
    }
}

columns! {
    /// Assignable port columns
    PortColumn for "port" {
        Name => "name": Text;
        Workflow => "workflow": BigInt;
        Type => "type": Text;
        Params => "params": Json;
    }
}

columns! {
    /// Assignable deployment columns
    DeploymentColumn for "deployment" {
        Name => "name": Text;
        Type => "type": Text;
        Config => "config": Json;
        External => "external": Boolean;
        Lazy => "lazy": Boolean;
        Workdir => "workdir": Text, nullable;
        Wraps => "wraps": Json, nullable;
    }
}

columns! {
    /// Assignable target columns
    TargetColumn for "target" {
        Params => "params": Json;
        Type => "type": Text;
        Deployment => "deployment": BigInt;
        Locations => "locations": Integer;
        Service => "service": Text, nullable;
        Workdir => "workdir": Text, nullable;
    }
}

columns! {
    /// Assignable execution columns
    ExecutionColumn for "execution" {
        Step => "step": BigInt;
        Tag => "tag": Text;
        Cmd => "cmd": Bytes;
        Status => "status": Integer, nullable;
        StartTime => "start_time": BigInt, nullable;
        EndTime => "end_time": BigInt, nullable;
    }
}

columns! {
    /// Assignable filter columns
    FilterColumn for "filter" {
        Name => "name": Text;
        Type => "type": Text;
        Config => "config": Json;
    }
}

/// Value assigned to a column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    Bytes(Vec<u8>),
    /// Untyped value, resolved against the column it is assigned to
    Json(serde_json::Value),
}

impl ColumnValue {
    /// Check the value against a column and normalize it to the column's representation
    pub(crate) fn coerce<C: Column>(&self, column: C) -> Result<ColumnValue, StoreError> {
        let mismatch = || StoreError::InvalidColumn {
            entity: C::ENTITY,
            reason: format!(
                "column '{}' expects {:?}, got {}",
                column.name(),
                column.sql_type(),
                self.kind()
            ),
        };

        if let Self::Json(value) = self {
            return Self::from_json(column, value)?.coerce(column);
        }

        match (column.sql_type(), self) {
            (_, Self::Null) if column.nullable() => Ok(Self::Null),
            (_, Self::Null) => Err(StoreError::InvalidColumn {
                entity: C::ENTITY,
                reason: format!("column '{}' is not nullable", column.name()),
            }),
            (SqlType::Integer, Self::Integer(v)) => i32::try_from(*v)
                .map(|_| self.clone())
                .map_err(|_| StoreError::InvalidColumn {
                    entity: C::ENTITY,
                    reason: format!("value {} out of range for column '{}'", v, column.name()),
                }),
            (SqlType::BigInt, Self::Integer(_))
            | (SqlType::Text, Self::Text(_))
            | (SqlType::Boolean, Self::Boolean(_))
            | (SqlType::Bytes, Self::Bytes(_)) => Ok(self.clone()),
            (SqlType::Bytes, Self::Text(s)) => Ok(Self::Bytes(s.as_bytes().to_vec())),
            (SqlType::Json, Self::Text(s)) => serde_json::from_str::<serde_json::Value>(s)
                .map(|v| Self::Text(v.to_string()))
                .map_err(|e| StoreError::Serialization(format!("column '{}': {}", column.name(), e))),
            _ => Err(mismatch()),
        }
    }

    /// Map a JSON value onto the representation `column` stores
    fn from_json<C: Column>(column: C, value: &serde_json::Value) -> Result<Self, StoreError> {
        use serde_json::Value;

        let resolved = match (column.sql_type(), value) {
            (_, Value::Null) if column.nullable() => Self::Null,
            (SqlType::Json, v) => Self::Text(v.to_string()),
            (_, Value::Null) => Self::Null,
            (SqlType::Integer | SqlType::BigInt, Value::Number(n)) => match n.as_i64() {
                Some(v) => Self::Integer(v),
                None => {
                    return Err(StoreError::InvalidColumn {
                        entity: C::ENTITY,
                        reason: format!("column '{}' expects an integer, got {}", column.name(), n),
                    })
                }
            },
            (SqlType::Boolean, Value::Bool(b)) => Self::Boolean(*b),
            (SqlType::Text | SqlType::Bytes, Value::String(s)) => Self::Text(s.clone()),
            (sql_type, v) => {
                return Err(StoreError::InvalidColumn {
                    entity: C::ENTITY,
                    reason: format!(
                        "column '{}' expects {:?}, got {}",
                        column.name(),
                        sql_type,
                        v
                    ),
                })
            }
        };
        Ok(resolved)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Text(_) => "text",
            Self::Boolean(_) => "boolean",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for ColumnValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for ColumnValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

/// JSON columns store the canonical text; scalar columns take the matching scalar
impl From<serde_json::Value> for ColumnValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<&serde_json::Value> for ColumnValue {
    fn from(v: &serde_json::Value) -> Self {
        Self::Json(v.clone())
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Ordered set of column assignments for one entity kind
///
/// Assigning the same column twice keeps the last value.
///
/// ```
/// use lineage_store::persistence::{StepColumn, Updates};
///
/// let updates = Updates::new()
///     .set(StepColumn::Status, 3)
///     .set(StepColumn::Params, serde_json::json!({"retries": 2}));
/// assert_eq!(updates.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Updates<C: Column> {
    assignments: Vec<(C, ColumnValue)>,
}

impl<C: Column> Default for Updates<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Column> Updates<C> {
    pub fn new() -> Self {
        Self {
            assignments: Vec::new(),
        }
    }

    /// Assign `value` to `column`
    pub fn set(mut self, column: C, value: impl Into<ColumnValue>) -> Self {
        let value = value.into();
        match self.assignments.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.assignments.push((column, value)),
        }
        self
    }

    /// Build assignments from `(name, value)` pairs, rejecting unknown names and `id`
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ColumnValue>,
    {
        pairs.into_iter().try_fold(Self::new(), |updates, (name, value)| {
            let column: C = name.as_ref().parse()?;
            Ok(updates.set(column, value))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Value assigned to `column`, if any
    pub fn get(&self, column: C) -> Option<&ColumnValue> {
        self.assignments
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
    }

    /// Validate every assignment, returning them normalized to their column types
    ///
    /// Fails on an empty set, so a malformed update never reaches the engine.
    pub(crate) fn checked(&self, id: i64) -> Result<Vec<(C, ColumnValue)>, StoreError> {
        if self.is_empty() {
            return Err(StoreError::EmptyUpdate {
                entity: C::ENTITY,
                id,
            });
        }
        self.assignments
            .iter()
            .map(|(column, value)| Ok((*column, value.coerce(*column)?)))
            .collect()
    }

    /// `UPDATE` statement for these assignments; `$1` is the row id
    pub(crate) fn statement(&self) -> String {
        let assignments = self
            .assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ${}", column.name(), i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        format!("UPDATE {} SET {} WHERE id = $1", C::ENTITY, assignments)
    }
}
