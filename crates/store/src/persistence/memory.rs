//! In-memory implementation of Database for testing
//!
//! Mirrors the PostgreSQL backend: identifiers are assigned in ascending order
//! per table, foreign keys are enforced, and list queries use the same ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::columns::{
    Column, ColumnValue, DeploymentColumn, ExecutionColumn, FilterColumn, PortColumn, StepColumn,
    TargetColumn, Updates, WorkflowColumn,
};
use super::store::*;
use crate::error::StoreError;

/// Rows of one table with its identifier sequence
struct Table<T> {
    rows: BTreeMap<i64, T>,
    last_id: i64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            last_id: 0,
        }
    }
}

impl<T> Table<T> {
    fn insert(&mut self, build: impl FnOnce(i64) -> T) -> i64 {
        self.last_id += 1;
        let id = self.last_id;
        self.rows.insert(id, build(id));
        id
    }

    fn contains(&self, id: i64) -> bool {
        self.rows.contains_key(&id)
    }
}

/// Edge key: (step, port, type, name)
type DependencyKey = (StepId, PortId, DependencyType, String);

#[derive(Default)]
struct Tables {
    workflows: Table<WorkflowRecord>,
    steps: Table<StepRecord>,
    ports: Table<PortRecord>,
    tokens: Table<TokenRecord>,
    executions: Table<ExecutionRecord>,
    deployments: Table<DeploymentRecord>,
    targets: Table<TargetRecord>,
    filters: Table<FilterRecord>,
    dependencies: BTreeSet<DependencyKey>,
    /// (dependee, depender)
    provenance: BTreeSet<(TokenId, TokenId)>,
}

/// In-memory implementation of Database
///
/// Stores everything in memory with the same semantics as the PostgreSQL
/// implementation. Read and write counters let tests observe which calls
/// reached the store.
///
/// # Example
///
/// ```
/// use lineage_store::InMemoryDatabase;
///
/// let db = InMemoryDatabase::new();
/// assert_eq!(db.write_count(), 0);
/// ```
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryDatabase {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of read operations served so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write operations applied so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.tables.read().workflows.rows.len()
    }

    /// Clear all data and counters (for testing)
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
    }

    fn read(&self) -> parking_lot::RwLockReadGuard<'_, Tables> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.tables.read()
    }

    fn write(&self) -> parking_lot::RwLockWriteGuard<'_, Tables> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.tables.write()
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(entity: &str, id: i64) -> StoreError {
    StoreError::ConstraintViolation(format!("{} {} does not exist", entity, id))
}

fn require<T>(table: &Table<T>, entity: &str, id: i64) -> Result<(), StoreError> {
    if table.contains(id) {
        Ok(())
    } else {
        Err(missing(entity, id))
    }
}

// ============================================
// Column assignment
// ============================================

fn int<C: Column>(column: C, value: &ColumnValue) -> Result<i64, StoreError> {
    value.as_i64().ok_or_else(|| mismatch(column, value))
}

fn int32<C: Column>(column: C, value: &ColumnValue) -> Result<i32, StoreError> {
    i32::try_from(int(column, value)?).map_err(|_| mismatch(column, value))
}

fn text<C: Column>(column: C, value: &ColumnValue) -> Result<String, StoreError> {
    value
        .as_text()
        .map(str::to_string)
        .ok_or_else(|| mismatch(column, value))
}

fn boolean<C: Column>(column: C, value: &ColumnValue) -> Result<bool, StoreError> {
    value.as_bool().ok_or_else(|| mismatch(column, value))
}

fn json<C: Column>(column: C, value: &ColumnValue) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::from_str(&text(column, value)?)?)
}

fn bytes<C: Column>(column: C, value: &ColumnValue) -> Result<Vec<u8>, StoreError> {
    match value {
        ColumnValue::Bytes(b) => Ok(b.clone()),
        _ => Err(mismatch(column, value)),
    }
}

/// `None` for NULL, otherwise the decoded value
fn nullable<C: Column, T>(
    column: C,
    value: &ColumnValue,
    decode: fn(C, &ColumnValue) -> Result<T, StoreError>,
) -> Result<Option<T>, StoreError> {
    match value {
        ColumnValue::Null => Ok(None),
        other => decode(column, other).map(Some),
    }
}

fn mismatch<C: Column>(column: C, value: &ColumnValue) -> StoreError {
    StoreError::InvalidColumn {
        entity: C::ENTITY,
        reason: format!("cannot assign {:?} to column '{}'", value, column.name()),
    }
}

fn assign_workflow(
    row: &mut WorkflowRecord,
    column: WorkflowColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        WorkflowColumn::Name => row.name = text(column, value)?,
        WorkflowColumn::Params => row.params = json(column, value)?,
        WorkflowColumn::Status => row.status = int32(column, value)?,
        WorkflowColumn::Type => row.workflow_type = text(column, value)?,
        WorkflowColumn::StartTime => row.start_time = nullable(column, value, int)?,
        WorkflowColumn::EndTime => row.end_time = nullable(column, value, int)?,
    }
    Ok(())
}

fn assign_step(
    row: &mut StepRecord,
    column: StepColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        StepColumn::Name => row.name = text(column, value)?,
        StepColumn::Workflow => row.workflow = int(column, value)?,
        StepColumn::Status => row.status = int32(column, value)?,
        StepColumn::Type => row.step_type = text(column, value)?,
        StepColumn::Params => row.params = json(column, value)?,
    }
    Ok(())
}

fn assign_port(
    row: &mut PortRecord,
    column: PortColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        PortColumn::Name => row.name = text(column, value)?,
        PortColumn::Workflow => row.workflow = int(column, value)?,
        PortColumn::Type => row.port_type = text(column, value)?,
        PortColumn::Params => row.params = json(column, value)?,
    }
    Ok(())
}

fn assign_execution(
    row: &mut ExecutionRecord,
    column: ExecutionColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        ExecutionColumn::Step => row.step = int(column, value)?,
        ExecutionColumn::Tag => row.tag = text(column, value)?,
        ExecutionColumn::Cmd => row.cmd = bytes(column, value)?,
        ExecutionColumn::Status => row.status = nullable(column, value, int32)?,
        ExecutionColumn::StartTime => row.start_time = nullable(column, value, int)?,
        ExecutionColumn::EndTime => row.end_time = nullable(column, value, int)?,
    }
    Ok(())
}

fn assign_deployment(
    row: &mut DeploymentRecord,
    column: DeploymentColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        DeploymentColumn::Name => row.name = text(column, value)?,
        DeploymentColumn::Type => row.deployment_type = text(column, value)?,
        DeploymentColumn::Config => row.config = json(column, value)?,
        DeploymentColumn::External => row.external = boolean(column, value)?,
        DeploymentColumn::Lazy => row.lazy = boolean(column, value)?,
        DeploymentColumn::Workdir => row.workdir = nullable(column, value, text)?,
        DeploymentColumn::Wraps => row.wraps = nullable(column, value, json)?,
    }
    Ok(())
}

fn assign_target(
    row: &mut TargetRecord,
    column: TargetColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        TargetColumn::Params => row.params = json(column, value)?,
        TargetColumn::Type => row.target_type = text(column, value)?,
        TargetColumn::Deployment => row.deployment = int(column, value)?,
        TargetColumn::Locations => row.locations = int32(column, value)?,
        TargetColumn::Service => row.service = nullable(column, value, text)?,
        TargetColumn::Workdir => row.workdir = nullable(column, value, text)?,
    }
    Ok(())
}

fn assign_filter(
    row: &mut FilterRecord,
    column: FilterColumn,
    value: &ColumnValue,
) -> Result<(), StoreError> {
    match column {
        FilterColumn::Name => row.name = text(column, value)?,
        FilterColumn::Type => row.filter_type = text(column, value)?,
        FilterColumn::Config => row.config = json(column, value)?,
    }
    Ok(())
}

/// Apply checked assignments to a copy of the row, then swap it in
///
/// A row that does not exist is left alone, like an UPDATE matching no rows.
fn apply<T: Clone, C: Column>(
    table: &Table<T>,
    id: i64,
    assignments: &[(C, ColumnValue)],
    assign: fn(&mut T, C, &ColumnValue) -> Result<(), StoreError>,
) -> Result<Option<T>, StoreError> {
    let Some(row) = table.rows.get(&id) else {
        return Ok(None);
    };
    let mut updated = row.clone();
    for (column, value) in assignments {
        assign(&mut updated, *column, value)?;
    }
    Ok(Some(updated))
}

fn dependency_records<'a>(
    keys: impl Iterator<Item = &'a DependencyKey>,
) -> Vec<DependencyRecord> {
    keys.map(|(step, port, dependency_type, name)| DependencyRecord {
        step: *step,
        port: *port,
        dependency_type: *dependency_type,
        name: name.clone(),
    })
    .collect()
}

impl InMemoryDatabase {
    fn edges_of_step(
        &self,
        step: StepId,
        dependency_type: DependencyType,
    ) -> Vec<DependencyRecord> {
        let tables = self.read();
        let mut edges = dependency_records(
            tables
                .dependencies
                .iter()
                .filter(|(s, _, t, _)| *s == step && *t == dependency_type),
        );
        edges.sort_by(|a, b| (a.port, &a.name).cmp(&(b.port, &b.name)));
        edges
    }

    fn edges_of_port(
        &self,
        port: PortId,
        dependency_type: DependencyType,
    ) -> Vec<DependencyRecord> {
        let tables = self.read();
        let mut edges = dependency_records(
            tables
                .dependencies
                .iter()
                .filter(|(_, p, t, _)| *p == port && *t == dependency_type),
        );
        edges.sort_by(|a, b| (a.step, &a.name).cmp(&(b.step, &b.name)));
        edges
    }
}

fn report_entries(tables: &Tables, workflow: WorkflowId) -> Vec<ReportEntry> {
    tables
        .executions
        .rows
        .values()
        .filter_map(|execution| {
            let step = tables.steps.rows.get(&execution.step)?;
            (step.workflow == workflow).then(|| ReportEntry {
                execution: execution.id,
                step_name: step.name.clone(),
                start_time: execution.start_time,
                end_time: execution.end_time,
            })
        })
        .collect()
}

#[async_trait]
impl Database for InMemoryDatabase {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn add_workflow(&self, input: CreateWorkflow) -> Result<WorkflowId, StoreError> {
        let mut tables = self.write();
        Ok(tables.workflows.insert(|id| WorkflowRecord {
            id,
            name: input.name,
            params: input.params,
            status: input.status,
            workflow_type: input.workflow_type,
            start_time: None,
            end_time: None,
        }))
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.read().workflows.rows.get(&id).cloned())
    }

    async fn update_workflow(
        &self,
        id: WorkflowId,
        updates: Updates<WorkflowColumn>,
    ) -> Result<WorkflowId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.workflows, id, &assignments, assign_workflow)? {
            tables.workflows.rows.insert(id, row);
        }
        Ok(id)
    }

    async fn list_workflows_by_name(
        &self,
        name: &str,
        last_only: bool,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let tables = self.read();
        let matching = tables
            .workflows
            .rows
            .values()
            .rev()
            .filter(|w| w.name == name)
            .cloned();

        Ok(if last_only {
            matching.take(1).collect()
        } else {
            matching.collect()
        })
    }

    async fn count_workflows_by_name_and_type(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let tables = self.read();
        let mut counts: BTreeMap<(&str, &str), i64> = BTreeMap::new();
        for workflow in tables.workflows.rows.values() {
            *counts
                .entry((workflow.name.as_str(), workflow.workflow_type.as_str()))
                .or_default() += 1;
        }

        let mut summaries: Vec<WorkflowSummary> = counts
            .into_iter()
            .map(|((name, workflow_type), count)| WorkflowSummary {
                name: name.to_string(),
                workflow_type: workflow_type.to_string(),
                count,
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.name
                .cmp(&a.name)
                .then_with(|| a.workflow_type.cmp(&b.workflow_type))
        });
        Ok(summaries)
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn add_step(&self, input: CreateStep) -> Result<StepId, StoreError> {
        let mut tables = self.write();
        require(&tables.workflows, "workflow", input.workflow)?;
        Ok(tables.steps.insert(|id| StepRecord {
            id,
            name: input.name,
            workflow: input.workflow,
            status: input.status,
            step_type: input.step_type,
            params: input.params,
        }))
    }

    async fn get_step(&self, id: StepId) -> Result<Option<StepRecord>, StoreError> {
        Ok(self.read().steps.rows.get(&id).cloned())
    }

    async fn update_step(
        &self,
        id: StepId,
        updates: Updates<StepColumn>,
    ) -> Result<StepId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.steps, id, &assignments, assign_step)? {
            require(&tables.workflows, "workflow", row.workflow)?;
            tables.steps.rows.insert(id, row);
        }
        Ok(id)
    }

    async fn list_workflow_steps(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<StepRecord>, StoreError> {
        Ok(self
            .read()
            .steps
            .rows
            .values()
            .filter(|s| s.workflow == workflow)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Ports
    // =========================================================================

    async fn add_port(&self, input: CreatePort) -> Result<PortId, StoreError> {
        let mut tables = self.write();
        require(&tables.workflows, "workflow", input.workflow)?;
        Ok(tables.ports.insert(|id| PortRecord {
            id,
            name: input.name,
            workflow: input.workflow,
            port_type: input.port_type,
            params: input.params,
        }))
    }

    async fn get_port(&self, id: PortId) -> Result<Option<PortRecord>, StoreError> {
        Ok(self.read().ports.rows.get(&id).cloned())
    }

    async fn update_port(
        &self,
        id: PortId,
        updates: Updates<PortColumn>,
    ) -> Result<PortId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.ports, id, &assignments, assign_port)? {
            require(&tables.workflows, "workflow", row.workflow)?;
            tables.ports.rows.insert(id, row);
        }
        Ok(id)
    }

    async fn list_workflow_ports(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<PortRecord>, StoreError> {
        Ok(self
            .read()
            .ports
            .rows
            .values()
            .filter(|p| p.workflow == workflow)
            .cloned()
            .collect())
    }

    async fn get_port_from_token(&self, token: TokenId) -> Result<Option<PortRecord>, StoreError> {
        let tables = self.read();
        Ok(tables
            .tokens
            .rows
            .get(&token)
            .and_then(|t| t.port)
            .and_then(|port| tables.ports.rows.get(&port))
            .cloned())
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    async fn add_token(&self, input: CreateToken) -> Result<TokenId, StoreError> {
        let mut tables = self.write();
        if let Some(port) = input.port {
            require(&tables.ports, "port", port)?;
        }
        Ok(tables.tokens.insert(|id| TokenRecord {
            id,
            port: input.port,
            token_type: input.token_type,
            tag: input.tag,
            value: input.value,
        }))
    }

    async fn get_token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.read().tokens.rows.get(&id).cloned())
    }

    async fn list_port_tokens(&self, port: PortId) -> Result<Vec<TokenId>, StoreError> {
        Ok(self
            .read()
            .tokens
            .rows
            .values()
            .filter(|t| t.port == Some(port))
            .map(|t| t.id)
            .collect())
    }

    // =========================================================================
    // Executions
    // =========================================================================

    async fn add_execution(&self, input: CreateExecution) -> Result<ExecutionId, StoreError> {
        let mut tables = self.write();
        require(&tables.steps, "step", input.step)?;
        Ok(tables.executions.insert(|id| ExecutionRecord {
            id,
            step: input.step,
            tag: input.tag,
            cmd: input.cmd.into_bytes(),
            status: None,
            start_time: None,
            end_time: None,
        }))
    }

    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.read().executions.rows.get(&id).cloned())
    }

    async fn update_execution(
        &self,
        id: ExecutionId,
        updates: Updates<ExecutionColumn>,
    ) -> Result<ExecutionId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.executions, id, &assignments, assign_execution)? {
            require(&tables.steps, "step", row.step)?;
            tables.executions.rows.insert(id, row);
        }
        Ok(id)
    }

    async fn list_step_executions(
        &self,
        step: StepId,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .read()
            .executions
            .rows
            .values()
            .filter(|e| e.step == step)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Deployments and targets
    // =========================================================================

    async fn add_deployment(&self, input: CreateDeployment) -> Result<DeploymentId, StoreError> {
        let mut tables = self.write();
        Ok(tables.deployments.insert(|id| DeploymentRecord {
            id,
            name: input.name,
            deployment_type: input.deployment_type,
            config: input.config,
            external: input.external,
            lazy: input.lazy,
            workdir: input.workdir,
            wraps: input.wraps,
        }))
    }

    async fn get_deployment(
        &self,
        id: DeploymentId,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.read().deployments.rows.get(&id).cloned())
    }

    async fn update_deployment(
        &self,
        id: DeploymentId,
        updates: Updates<DeploymentColumn>,
    ) -> Result<DeploymentId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.deployments, id, &assignments, assign_deployment)? {
            tables.deployments.rows.insert(id, row);
        }
        Ok(id)
    }

    async fn add_target(&self, input: CreateTarget) -> Result<TargetId, StoreError> {
        let mut tables = self.write();
        require(&tables.deployments, "deployment", input.deployment)?;
        Ok(tables.targets.insert(|id| TargetRecord {
            id,
            deployment: input.deployment,
            target_type: input.target_type,
            params: input.params,
            locations: input.locations,
            service: input.service,
            workdir: input.workdir,
        }))
    }

    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError> {
        Ok(self.read().targets.rows.get(&id).cloned())
    }

    async fn update_target(
        &self,
        id: TargetId,
        updates: Updates<TargetColumn>,
    ) -> Result<TargetId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.targets, id, &assignments, assign_target)? {
            require(&tables.deployments, "deployment", row.deployment)?;
            tables.targets.rows.insert(id, row);
        }
        Ok(id)
    }

    // =========================================================================
    // Filters
    // =========================================================================

    async fn add_filter(&self, input: CreateFilter) -> Result<FilterId, StoreError> {
        let mut tables = self.write();
        Ok(tables.filters.insert(|id| FilterRecord {
            id,
            name: input.name,
            filter_type: input.filter_type,
            config: input.config,
        }))
    }

    async fn get_filter(&self, id: FilterId) -> Result<Option<FilterRecord>, StoreError> {
        Ok(self.read().filters.rows.get(&id).cloned())
    }

    async fn update_filter(
        &self,
        id: FilterId,
        updates: Updates<FilterColumn>,
    ) -> Result<FilterId, StoreError> {
        let assignments = updates.checked(id)?;
        let mut tables = self.write();
        if let Some(row) = apply(&tables.filters, id, &assignments, assign_filter)? {
            tables.filters.rows.insert(id, row);
        }
        Ok(id)
    }

    // =========================================================================
    // Step/port topology
    // =========================================================================

    async fn record_dependency(
        &self,
        step: StepId,
        port: PortId,
        dependency_type: DependencyType,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();
        require(&tables.steps, "step", step)?;
        require(&tables.ports, "port", port)?;
        tables
            .dependencies
            .insert((step, port, dependency_type, name.to_string()));
        Ok(())
    }

    async fn input_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        Ok(self.edges_of_step(step, DependencyType::Input))
    }

    async fn output_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        Ok(self.edges_of_step(step, DependencyType::Output))
    }

    async fn input_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        Ok(self.edges_of_port(port, DependencyType::Output))
    }

    async fn output_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        Ok(self.edges_of_port(port, DependencyType::Input))
    }

    // =========================================================================
    // Token provenance
    // =========================================================================

    async fn record_provenance(
        &self,
        dependees: &[TokenId],
        depender: TokenId,
    ) -> Result<(), StoreError> {
        if dependees.is_empty() {
            return Ok(());
        }

        let mut tables = self.write();
        require(&tables.tokens, "token", depender)?;
        for dependee in dependees {
            require(&tables.tokens, "token", *dependee)?;
        }
        for dependee in dependees {
            tables.provenance.insert((*dependee, depender));
        }
        Ok(())
    }

    async fn dependees_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        Ok(self
            .read()
            .provenance
            .iter()
            .filter(|(_, depender)| *depender == token)
            .map(|(dependee, depender)| ProvenanceRecord {
                dependee: *dependee,
                depender: *depender,
            })
            .collect())
    }

    async fn dependers_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        Ok(self
            .read()
            .provenance
            .range((token, TokenId::MIN)..=(token, TokenId::MAX))
            .map(|(dependee, depender)| ProvenanceRecord {
                dependee: *dependee,
                depender: *depender,
            })
            .collect())
    }

    // =========================================================================
    // Reports
    // =========================================================================

    async fn reports(
        &self,
        workflow: &str,
        last_only: bool,
    ) -> Result<Vec<Vec<ReportEntry>>, StoreError> {
        let tables = self.read();
        let mut ids = tables
            .workflows
            .rows
            .values()
            .rev()
            .filter(|w| w.name == workflow)
            .map(|w| w.id);

        if last_only {
            let entries = ids
                .next()
                .map(|id| report_entries(&tables, id))
                .unwrap_or_default();
            return Ok(vec![entries]);
        }

        let mut groups = ReportGroups::default();
        for id in ids {
            for entry in report_entries(&tables, id) {
                groups.push(id, entry);
            }
        }
        Ok(groups.into_groups())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn workflow(db: &InMemoryDatabase, name: &str) -> WorkflowId {
        db.add_workflow(CreateWorkflow {
            name: name.to_string(),
            params: json!({}),
            status: 0,
            workflow_type: "cwl".to_string(),
        })
        .await
        .unwrap()
    }

    async fn step(db: &InMemoryDatabase, workflow: WorkflowId, name: &str) -> StepId {
        db.add_step(CreateStep {
            name: name.to_string(),
            workflow,
            status: 0,
            step_type: "ExecuteStep".to_string(),
            params: json!({}),
        })
        .await
        .unwrap()
    }

    async fn token(db: &InMemoryDatabase, tag: &str) -> TokenId {
        db.add_token(CreateToken {
            port: None,
            token_type: "Token".to_string(),
            tag: tag.to_string(),
            value: b"v".to_vec(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_assigned_per_table() {
        let db = InMemoryDatabase::new();
        let w1 = workflow(&db, "wf").await;
        let w2 = workflow(&db, "wf").await;
        let s1 = step(&db, w1, "/a").await;

        assert!(w2 > w1);
        assert_eq!(s1, 1);
        assert_eq!(db.workflow_count(), 2);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let db = InMemoryDatabase::new();
        let err = db
            .add_step(CreateStep {
                name: "/orphan".to_string(),
                workflow: 42,
                status: 0,
                step_type: "ExecuteStep".to_string(),
                params: json!({}),
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let w = workflow(&db, "wf").await;
        let s = step(&db, w, "/a").await;
        let err = db
            .update_step(s, Updates::new().set(StepColumn::Workflow, 99_i64))
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(db.get_step(s).await.unwrap().unwrap().workflow, w);
    }

    #[tokio::test]
    async fn test_update_is_atomic_per_row() {
        let db = InMemoryDatabase::new();
        let w = workflow(&db, "wf").await;

        db.update_workflow(
            w,
            Updates::new()
                .set(WorkflowColumn::Status, 2)
                .set(WorkflowColumn::StartTime, 1_000_i64)
                .set(WorkflowColumn::Params, json!({"k": [1, 2]})),
        )
        .await
        .unwrap();

        let record = db.get_workflow(w).await.unwrap().unwrap();
        assert_eq!(record.status, 2);
        assert_eq!(record.start_time, Some(1_000));
        assert_eq!(record.params, json!({"k": [1, 2]}));
        assert_eq!(record.name, "wf");
    }

    #[tokio::test]
    async fn test_empty_update_does_not_reach_the_store() {
        let db = InMemoryDatabase::new();
        let w = workflow(&db, "wf").await;
        let writes = db.write_count();

        let err = db.update_workflow(w, Updates::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyUpdate { entity: "workflow", .. }));
        assert_eq!(db.write_count(), writes);
    }

    #[tokio::test]
    async fn test_update_of_missing_row_returns_id() {
        let db = InMemoryDatabase::new();
        let id = db
            .update_filter(77, Updates::new().set(FilterColumn::Name, "f"))
            .await
            .unwrap();
        assert_eq!(id, 77);
        assert!(db.get_filter(77).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nullable_columns_can_be_cleared() {
        let db = InMemoryDatabase::new();
        let d = db
            .add_deployment(CreateDeployment {
                name: "local".to_string(),
                deployment_type: "local".to_string(),
                config: json!({}),
                external: false,
                lazy: true,
                workdir: Some("/tmp".to_string()),
                wraps: Some(json!({"deployment": "docker"})),
            })
            .await
            .unwrap();

        db.update_deployment(
            d,
            Updates::new()
                .set(DeploymentColumn::Workdir, None::<String>)
                .set(DeploymentColumn::Wraps, None::<serde_json::Value>),
        )
        .await
        .unwrap();

        let record = db.get_deployment(d).await.unwrap().unwrap();
        assert_eq!(record.workdir, None);
        assert_eq!(record.wraps, None);
        assert!(record.lazy);
    }

    #[tokio::test]
    async fn test_provenance_is_a_set() {
        let db = InMemoryDatabase::new();
        let a = token(&db, "0.0").await;
        let b = token(&db, "0.1").await;
        let c = token(&db, "0.2").await;

        db.record_provenance(&[a, b, a], c).await.unwrap();
        db.record_provenance(&[a], c).await.unwrap();

        let dependees = db.dependees_of(c).await.unwrap();
        assert_eq!(
            dependees.iter().map(|p| p.dependee).collect::<Vec<_>>(),
            vec![a, b]
        );
        assert_eq!(db.dependers_of(a).await.unwrap().len(), 1);
        assert!(db.dependers_of(c).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provenance_rejects_unknown_tokens() {
        let db = InMemoryDatabase::new();
        let a = token(&db, "0").await;
        let err = db.record_provenance(&[a, 404], a).await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(db.dependees_of(a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_workflows_newest_first() {
        let db = InMemoryDatabase::new();
        let first = workflow(&db, "wf").await;
        workflow(&db, "other").await;
        let last = workflow(&db, "wf").await;

        let all = db.list_workflows_by_name("wf", false).await.unwrap();
        assert_eq!(all.iter().map(|w| w.id).collect::<Vec<_>>(), vec![last, first]);

        let newest = db.list_workflows_by_name("wf", true).await.unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].id, last);
    }

    #[tokio::test]
    async fn test_count_workflows_orders_names_descending() {
        let db = InMemoryDatabase::new();
        workflow(&db, "alpha").await;
        workflow(&db, "beta").await;
        workflow(&db, "beta").await;

        let summaries = db.count_workflows_by_name_and_type().await.unwrap();
        assert_eq!(
            summaries,
            vec![
                WorkflowSummary {
                    name: "beta".to_string(),
                    workflow_type: "cwl".to_string(),
                    count: 2
                },
                WorkflowSummary {
                    name: "alpha".to_string(),
                    workflow_type: "cwl".to_string(),
                    count: 1
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_reads_are_counted() {
        let db = InMemoryDatabase::new();
        let w = workflow(&db, "wf").await;
        db.get_workflow(w).await.unwrap();
        db.get_workflow(w).await.unwrap();
        assert_eq!(db.read_count(), 2);

        db.clear();
        assert_eq!(db.read_count(), 0);
        assert_eq!(db.workflow_count(), 0);
    }
}
