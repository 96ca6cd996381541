//! Database trait definition

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::columns::{
    DeploymentColumn, ExecutionColumn, FilterColumn, PortColumn, StepColumn, TargetColumn,
    Updates, WorkflowColumn,
};
use crate::error::StoreError;

/// Store-assigned workflow identifier
pub type WorkflowId = i64;
pub type StepId = i64;
pub type PortId = i64;
pub type TokenId = i64;
pub type DeploymentId = i64;
pub type TargetId = i64;
pub type ExecutionId = i64;
pub type FilterId = i64;

/// Direction of a step/port edge, seen from the step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The port feeds the step
    Input,
    /// The step writes to the port
    Output,
}

impl DependencyType {
    /// Stored integer encoding
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }
}

impl TryFrom<i32> for DependencyType {
    type Error = StoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Input),
            1 => Ok(Self::Output),
            other => Err(StoreError::Database(format!(
                "Unknown dependency type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

fn datetime_from_nanos(nanos: Option<i64>) -> Option<DateTime<Utc>> {
    nanos.map(DateTime::<Utc>::from_timestamp_nanos)
}

// ============================================
// Inputs
// ============================================

#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub name: String,
    pub params: serde_json::Value,
    pub status: i32,
    /// Caller-chosen type tag, stored verbatim
    pub workflow_type: String,
}

#[derive(Debug, Clone)]
pub struct CreateStep {
    pub name: String,
    pub workflow: WorkflowId,
    pub status: i32,
    pub step_type: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreatePort {
    pub name: String,
    pub workflow: WorkflowId,
    pub port_type: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreateToken {
    /// Port the token was emitted on, if any
    pub port: Option<PortId>,
    pub token_type: String,
    /// Lineage label
    pub tag: String,
    /// Opaque payload, stored byte for byte
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateDeployment {
    pub name: String,
    pub deployment_type: String,
    pub config: serde_json::Value,
    pub external: bool,
    pub lazy: bool,
    pub workdir: Option<String>,
    /// Deployment this one wraps, if any
    pub wraps: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CreateTarget {
    pub deployment: DeploymentId,
    pub target_type: String,
    pub params: serde_json::Value,
    pub locations: i32,
    pub service: Option<String>,
    pub workdir: Option<String>,
}

impl CreateTarget {
    /// Target with a single location and no service or workdir
    pub fn new(
        deployment: DeploymentId,
        target_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            deployment,
            target_type: target_type.into(),
            params,
            locations: 1,
            service: None,
            workdir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub step: StepId,
    pub tag: String,
    /// Command line, stored as UTF-8 bytes
    pub cmd: String,
}

#[derive(Debug, Clone)]
pub struct CreateFilter {
    pub name: String,
    pub filter_type: String,
    pub config: serde_json::Value,
}

// ============================================
// Records
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub params: serde_json::Value,
    pub status: i32,
    pub workflow_type: String,
    /// Start time, nanoseconds since the epoch
    pub start_time: Option<i64>,
    /// End time, nanoseconds since the epoch
    pub end_time: Option<i64>,
}

impl WorkflowRecord {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        datetime_from_nanos(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        datetime_from_nanos(self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub id: StepId,
    pub name: String,
    pub workflow: WorkflowId,
    pub status: i32,
    pub step_type: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortRecord {
    pub id: PortId,
    pub name: String,
    pub workflow: WorkflowId,
    pub port_type: String,
    pub params: serde_json::Value,
}

/// Step/port edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyRecord {
    pub step: StepId,
    pub port: PortId,
    pub dependency_type: DependencyType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub port: Option<PortId>,
    pub token_type: String,
    pub tag: String,
    pub value: Vec<u8>,
}

impl TokenRecord {
    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn value_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Token/token edge: `depender` was derived from `dependee`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ProvenanceRecord {
    pub dependee: TokenId,
    pub depender: TokenId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub name: String,
    pub deployment_type: String,
    pub config: serde_json::Value,
    pub external: bool,
    pub lazy: bool,
    pub workdir: Option<String>,
    pub wraps: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRecord {
    pub id: TargetId,
    pub deployment: DeploymentId,
    pub target_type: String,
    pub params: serde_json::Value,
    pub locations: i32,
    pub service: Option<String>,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub step: StepId,
    pub tag: String,
    pub cmd: Vec<u8>,
    pub status: Option<i32>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl ExecutionRecord {
    /// Command line as text, replacing invalid UTF-8 sequences
    pub fn cmd_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.cmd)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        datetime_from_nanos(self.start_time)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        datetime_from_nanos(self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterRecord {
    pub id: FilterId,
    pub name: String,
    pub filter_type: String,
    pub config: serde_json::Value,
}

/// Number of workflows sharing a name and type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub workflow_type: String,
    pub count: i64,
}

/// One execution in a workflow timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub execution: ExecutionId,
    pub step_name: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl ReportEntry {
    /// Wall-clock duration, when both ends are known and their difference fits in an `i64`
    pub fn duration(&self) -> Option<chrono::Duration> {
        let elapsed = self.end_time?.checked_sub(self.start_time?)?;
        Some(chrono::Duration::nanoseconds(elapsed))
    }
}

/// Buckets report rows by workflow, preserving arrival order
///
/// Groups appear in the order their first row arrived; rows keep their
/// arrival order within a group.
#[derive(Debug, Default)]
pub(crate) struct ReportGroups {
    groups: Vec<Vec<ReportEntry>>,
    index: HashMap<WorkflowId, usize>,
}

impl ReportGroups {
    pub(crate) fn push(&mut self, workflow: WorkflowId, entry: ReportEntry) {
        let slot = match self.index.get(&workflow) {
            Some(slot) => *slot,
            None => {
                self.groups.push(Vec::new());
                self.index.insert(workflow, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        self.groups[slot].push(entry);
    }

    pub(crate) fn into_groups(self) -> Vec<Vec<ReportEntry>> {
        self.groups
    }
}

/// Persistence and provenance store for a workflow engine
///
/// Every write runs in its own transaction. Point lookups return `Ok(None)`
/// for identifiers that do not exist; list queries return empty collections.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn add_workflow(&self, input: CreateWorkflow) -> Result<WorkflowId, StoreError>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Apply a partial update; returns `id`
    async fn update_workflow(
        &self,
        id: WorkflowId,
        updates: Updates<WorkflowColumn>,
    ) -> Result<WorkflowId, StoreError>;

    /// Workflows with the given name, newest first
    ///
    /// With `last_only`, at most the newest one is returned.
    async fn list_workflows_by_name(
        &self,
        name: &str,
        last_only: bool,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Workflow counts grouped by name and type, names descending
    async fn count_workflows_by_name_and_type(&self) -> Result<Vec<WorkflowSummary>, StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    async fn add_step(&self, input: CreateStep) -> Result<StepId, StoreError>;

    async fn get_step(&self, id: StepId) -> Result<Option<StepRecord>, StoreError>;

    async fn update_step(
        &self,
        id: StepId,
        updates: Updates<StepColumn>,
    ) -> Result<StepId, StoreError>;

    async fn list_workflow_steps(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Ports
    // =========================================================================

    async fn add_port(&self, input: CreatePort) -> Result<PortId, StoreError>;

    async fn get_port(&self, id: PortId) -> Result<Option<PortRecord>, StoreError>;

    async fn update_port(
        &self,
        id: PortId,
        updates: Updates<PortColumn>,
    ) -> Result<PortId, StoreError>;

    async fn list_workflow_ports(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<PortRecord>, StoreError>;

    /// Port a token was emitted on
    async fn get_port_from_token(&self, token: TokenId) -> Result<Option<PortRecord>, StoreError>;

    // =========================================================================
    // Tokens (immutable once created)
    // =========================================================================

    async fn add_token(&self, input: CreateToken) -> Result<TokenId, StoreError>;

    async fn get_token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError>;

    /// Identifiers of the tokens emitted on a port, ascending
    async fn list_port_tokens(&self, port: PortId) -> Result<Vec<TokenId>, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    async fn add_execution(&self, input: CreateExecution) -> Result<ExecutionId, StoreError>;

    async fn get_execution(&self, id: ExecutionId)
        -> Result<Option<ExecutionRecord>, StoreError>;

    async fn update_execution(
        &self,
        id: ExecutionId,
        updates: Updates<ExecutionColumn>,
    ) -> Result<ExecutionId, StoreError>;

    async fn list_step_executions(&self, step: StepId)
        -> Result<Vec<ExecutionRecord>, StoreError>;

    // =========================================================================
    // Deployments and targets
    // =========================================================================

    async fn add_deployment(&self, input: CreateDeployment) -> Result<DeploymentId, StoreError>;

    async fn get_deployment(
        &self,
        id: DeploymentId,
    ) -> Result<Option<DeploymentRecord>, StoreError>;

    async fn update_deployment(
        &self,
        id: DeploymentId,
        updates: Updates<DeploymentColumn>,
    ) -> Result<DeploymentId, StoreError>;

    async fn add_target(&self, input: CreateTarget) -> Result<TargetId, StoreError>;

    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError>;

    async fn update_target(
        &self,
        id: TargetId,
        updates: Updates<TargetColumn>,
    ) -> Result<TargetId, StoreError>;

    // =========================================================================
    // Filters
    // =========================================================================

    async fn add_filter(&self, input: CreateFilter) -> Result<FilterId, StoreError>;

    async fn get_filter(&self, id: FilterId) -> Result<Option<FilterRecord>, StoreError>;

    async fn update_filter(
        &self,
        id: FilterId,
        updates: Updates<FilterColumn>,
    ) -> Result<FilterId, StoreError>;

    // =========================================================================
    // Step/port topology
    // =========================================================================

    /// Record a step/port edge; recording an existing edge is a no-op
    async fn record_dependency(
        &self,
        step: StepId,
        port: PortId,
        dependency_type: DependencyType,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Edges where `port` feeds `step`
    async fn input_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError>;

    /// Edges where `step` writes to a port
    async fn output_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError>;

    /// Steps writing to `port` (edges with direction OUTPUT)
    async fn input_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError>;

    /// Steps reading from `port` (edges with direction INPUT)
    async fn output_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError>;

    // =========================================================================
    // Token provenance
    // =========================================================================

    /// Record that `depender` was derived from each of `dependees`
    ///
    /// Set-union semantics: existing edges and duplicates in `dependees` are absorbed.
    async fn record_provenance(
        &self,
        dependees: &[TokenId],
        depender: TokenId,
    ) -> Result<(), StoreError>;

    /// Edges whose depender is `token`
    async fn dependees_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError>;

    /// Edges whose dependee is `token`
    async fn dependers_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError>;

    // =========================================================================
    // Reports
    // =========================================================================

    /// Execution timelines of the workflows named `workflow`
    ///
    /// One group per workflow, newest workflow first. With `last_only`, only the
    /// newest workflow is reported and exactly one (possibly empty) group is returned.
    async fn reports(
        &self,
        workflow: &str,
        last_only: bool,
    ) -> Result<Vec<Vec<ReportEntry>>, StoreError>;

    // =========================================================================
    // Lifecycle (optional, default no-op)
    // =========================================================================

    /// Release every resource held by the store; it can be used again afterwards
    async fn close(&self) {}
}
