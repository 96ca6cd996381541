//! Write-through read cache in front of any Database
//!
//! Point lookups of workflows, steps, ports, targets, tokens, deployments and
//! filters are served from a [`ReadCache`] per kind. An update invalidates the
//! entry after the backend call returns, whether it succeeded, failed or the
//! caller dropped the future midway. Executions change while running and are
//! never cached.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::columns::{
    DeploymentColumn, ExecutionColumn, FilterColumn, PortColumn, StepColumn, TargetColumn,
    Updates, WorkflowColumn,
};
use super::store::*;
use crate::cache::{CacheStats, ReadCache, DEFAULT_CAPACITY};
use crate::error::StoreError;

/// Database decorator adding a read cache per entity kind
///
/// # Example
///
/// ```
/// use lineage_store::{CachedDatabase, InMemoryDatabase};
///
/// let db = CachedDatabase::new(InMemoryDatabase::new());
/// assert_eq!(db.cache_stats()["workflow"].entries, 0);
/// ```
pub struct CachedDatabase<D> {
    inner: D,
    workflows: ReadCache<WorkflowRecord>,
    steps: ReadCache<StepRecord>,
    ports: ReadCache<PortRecord>,
    targets: ReadCache<TargetRecord>,
    tokens: ReadCache<TokenRecord>,
    deployments: ReadCache<DeploymentRecord>,
    filters: ReadCache<FilterRecord>,
}

impl<D: Database> CachedDatabase<D> {
    /// Wrap `inner` with caches of [`DEFAULT_CAPACITY`] entries per kind
    pub fn new(inner: D) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    /// Wrap `inner` with caches of `capacity` entries per kind
    pub fn with_capacity(inner: D, capacity: usize) -> Self {
        Self {
            inner,
            workflows: ReadCache::bounded("workflow", capacity),
            steps: ReadCache::bounded("step", capacity),
            ports: ReadCache::bounded("port", capacity),
            targets: ReadCache::bounded("target", capacity),
            tokens: ReadCache::bounded("token", capacity),
            deployments: ReadCache::bounded("deployment", capacity),
            filters: ReadCache::bounded("filter", capacity),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Hit/miss counters of every cache, keyed by entity kind
    pub fn cache_stats(&self) -> BTreeMap<&'static str, CacheStats> {
        BTreeMap::from([
            (self.workflows.kind(), self.workflows.stats()),
            (self.steps.kind(), self.steps.stats()),
            (self.ports.kind(), self.ports.stats()),
            (self.targets.kind(), self.targets.stats()),
            (self.tokens.kind(), self.tokens.stats()),
            (self.deployments.kind(), self.deployments.stats()),
            (self.filters.kind(), self.filters.stats()),
        ])
    }

    /// Drop every cached entry
    pub fn clear_caches(&self) {
        self.workflows.clear();
        self.steps.clear();
        self.ports.clear();
        self.targets.clear();
        self.tokens.clear();
        self.deployments.clear();
        self.filters.clear();
    }
}

#[async_trait]
impl<D: Database> Database for CachedDatabase<D> {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn add_workflow(&self, input: CreateWorkflow) -> Result<WorkflowId, StoreError> {
        self.inner.add_workflow(input).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        self.workflows
            .get_or_fetch(id, || self.inner.get_workflow(id))
            .await
    }

    #[instrument(skip(self, updates))]
    async fn update_workflow(
        &self,
        id: WorkflowId,
        updates: Updates<WorkflowColumn>,
    ) -> Result<WorkflowId, StoreError> {
        let _invalidate = self.workflows.invalidate_on_drop(id);
        self.inner.update_workflow(id, updates).await
    }

    async fn list_workflows_by_name(
        &self,
        name: &str,
        last_only: bool,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.inner.list_workflows_by_name(name, last_only).await
    }

    async fn count_workflows_by_name_and_type(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        self.inner.count_workflows_by_name_and_type().await
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn add_step(&self, input: CreateStep) -> Result<StepId, StoreError> {
        self.inner.add_step(input).await
    }

    async fn get_step(&self, id: StepId) -> Result<Option<StepRecord>, StoreError> {
        self.steps.get_or_fetch(id, || self.inner.get_step(id)).await
    }

    #[instrument(skip(self, updates))]
    async fn update_step(
        &self,
        id: StepId,
        updates: Updates<StepColumn>,
    ) -> Result<StepId, StoreError> {
        let _invalidate = self.steps.invalidate_on_drop(id);
        self.inner.update_step(id, updates).await
    }

    async fn list_workflow_steps(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<StepRecord>, StoreError> {
        self.inner.list_workflow_steps(workflow).await
    }

    // =========================================================================
    // Ports
    // =========================================================================

    async fn add_port(&self, input: CreatePort) -> Result<PortId, StoreError> {
        self.inner.add_port(input).await
    }

    async fn get_port(&self, id: PortId) -> Result<Option<PortRecord>, StoreError> {
        self.ports.get_or_fetch(id, || self.inner.get_port(id)).await
    }

    #[instrument(skip(self, updates))]
    async fn update_port(
        &self,
        id: PortId,
        updates: Updates<PortColumn>,
    ) -> Result<PortId, StoreError> {
        let _invalidate = self.ports.invalidate_on_drop(id);
        self.inner.update_port(id, updates).await
    }

    async fn list_workflow_ports(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<PortRecord>, StoreError> {
        self.inner.list_workflow_ports(workflow).await
    }

    async fn get_port_from_token(&self, token: TokenId) -> Result<Option<PortRecord>, StoreError> {
        self.inner.get_port_from_token(token).await
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    async fn add_token(&self, input: CreateToken) -> Result<TokenId, StoreError> {
        self.inner.add_token(input).await
    }

    async fn get_token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        self.tokens.get_or_fetch(id, || self.inner.get_token(id)).await
    }

    async fn list_port_tokens(&self, port: PortId) -> Result<Vec<TokenId>, StoreError> {
        self.inner.list_port_tokens(port).await
    }

    // =========================================================================
    // Executions (not cached)
    // =========================================================================

    async fn add_execution(&self, input: CreateExecution) -> Result<ExecutionId, StoreError> {
        self.inner.add_execution(input).await
    }

    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.inner.get_execution(id).await
    }

    async fn update_execution(
        &self,
        id: ExecutionId,
        updates: Updates<ExecutionColumn>,
    ) -> Result<ExecutionId, StoreError> {
        self.inner.update_execution(id, updates).await
    }

    async fn list_step_executions(
        &self,
        step: StepId,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.list_step_executions(step).await
    }

    // =========================================================================
    // Deployments and targets
    // =========================================================================

    async fn add_deployment(&self, input: CreateDeployment) -> Result<DeploymentId, StoreError> {
        self.inner.add_deployment(input).await
    }

    async fn get_deployment(
        &self,
        id: DeploymentId,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        self.deployments
            .get_or_fetch(id, || self.inner.get_deployment(id))
            .await
    }

    #[instrument(skip(self, updates))]
    async fn update_deployment(
        &self,
        id: DeploymentId,
        updates: Updates<DeploymentColumn>,
    ) -> Result<DeploymentId, StoreError> {
        let _invalidate = self.deployments.invalidate_on_drop(id);
        self.inner.update_deployment(id, updates).await
    }

    async fn add_target(&self, input: CreateTarget) -> Result<TargetId, StoreError> {
        self.inner.add_target(input).await
    }

    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError> {
        self.targets
            .get_or_fetch(id, || self.inner.get_target(id))
            .await
    }

    #[instrument(skip(self, updates))]
    async fn update_target(
        &self,
        id: TargetId,
        updates: Updates<TargetColumn>,
    ) -> Result<TargetId, StoreError> {
        let _invalidate = self.targets.invalidate_on_drop(id);
        self.inner.update_target(id, updates).await
    }

    // =========================================================================
    // Filters
    // =========================================================================

    async fn add_filter(&self, input: CreateFilter) -> Result<FilterId, StoreError> {
        self.inner.add_filter(input).await
    }

    async fn get_filter(&self, id: FilterId) -> Result<Option<FilterRecord>, StoreError> {
        self.filters
            .get_or_fetch(id, || self.inner.get_filter(id))
            .await
    }

    #[instrument(skip(self, updates))]
    async fn update_filter(
        &self,
        id: FilterId,
        updates: Updates<FilterColumn>,
    ) -> Result<FilterId, StoreError> {
        let _invalidate = self.filters.invalidate_on_drop(id);
        self.inner.update_filter(id, updates).await
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
        self.inner
            .record_dependency(step, port, dependency_type, name)
            .await
    }

    async fn input_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.inner.input_ports_of(step).await
    }

    async fn output_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.inner.output_ports_of(step).await
    }

    async fn input_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.inner.input_steps_of(port).await
    }

    async fn output_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.inner.output_steps_of(port).await
    }

    // =========================================================================
    // Token provenance
    // =========================================================================

    async fn record_provenance(
        &self,
        dependees: &[TokenId],
        depender: TokenId,
    ) -> Result<(), StoreError> {
        self.inner.record_provenance(dependees, depender).await
    }

    async fn dependees_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        self.inner.dependees_of(token).await
    }

    async fn dependers_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        self.inner.dependers_of(token).await
    }

    // =========================================================================
    // Reports
    // =========================================================================

    async fn reports(
        &self,
        workflow: &str,
        last_only: bool,
    ) -> Result<Vec<Vec<ReportEntry>>, StoreError> {
        self.inner.reports(workflow, last_only).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn close(&self) {
        for (kind, stats) in self.cache_stats() {
            debug!(
                kind,
                hits = stats.hits,
                misses = stats.misses,
                entries = stats.entries,
                "read cache at close"
            );
        }
        self.clear_caches();
        self.inner.close().await;
    }
}
