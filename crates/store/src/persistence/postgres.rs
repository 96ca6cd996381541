//! PostgreSQL implementation of Database
//!
//! - One transaction per write, rolled back when dropped without commit
//! - Reads run on a pooled connection returned on every exit path
//! - Edge inserts are idempotent (`ON CONFLICT DO NOTHING`)

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::{debug, instrument};

use super::columns::{
    Column, ColumnValue, DeploymentColumn, ExecutionColumn, FilterColumn, PortColumn, SqlType,
    StepColumn, TargetColumn, Updates, WorkflowColumn,
};
use super::store::*;
use crate::config::DatabaseConfig;
use crate::error::{db_error, StoreError};
use crate::pool::ConnectionPool;

/// PostgreSQL implementation of Database
///
/// Clones share the same connection pool.
///
/// # Example
///
/// ```ignore
/// use lineage_store::{Database, DatabaseConfig, PostgresDatabase};
///
/// let db = PostgresDatabase::new(DatabaseConfig::from_env())?;
/// let workflow = db.add_workflow(CreateWorkflow { .. }).await?;
/// ```
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: Arc<ConnectionPool>,
}

impl PostgresDatabase {
    /// Create a store; the pool is created on first use
    pub fn new(config: DatabaseConfig) -> Result<Self, StoreError> {
        Ok(Self::with_pool(Arc::new(ConnectionPool::new(config)?)))
    }

    /// Create a store on an existing pool
    pub fn with_pool(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Create a store from `POSTGRES_*` environment variables
    pub fn from_env() -> Result<Self, StoreError> {
        Self::new(DatabaseConfig::from_env())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn apply_update<C: Column>(
        &self,
        id: i64,
        updates: &Updates<C>,
    ) -> Result<i64, StoreError> {
        let assignments = updates.checked(id)?;
        let statement = updates.statement();

        let mut query = sqlx::query(&statement).bind(id);
        for (column, value) in assignments {
            query = bind_value(query, column, value)?;
        }

        let mut tx = self.pool.begin().await?;
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(db_error("update row"))?;
        tx.commit().await.map_err(db_error("commit update"))?;

        debug!(
            entity = C::ENTITY,
            id,
            rows = result.rows_affected(),
            "updated row"
        );
        Ok(id)
    }

    async fn fetch_dependencies(
        &self,
        statement: &'static str,
        key: i64,
        dependency_type: DependencyType,
    ) -> Result<Vec<DependencyRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(statement)
            .bind(key)
            .bind(dependency_type.as_i32())
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get dependencies"))?;

        rows.iter().map(dependency_from_row).collect()
    }

    async fn fetch_provenance(
        &self,
        statement: &'static str,
        token: TokenId,
    ) -> Result<Vec<ProvenanceRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(statement)
            .bind(token)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get provenance"))?;

        rows.iter()
            .map(|row| {
                Ok(ProvenanceRecord {
                    dependee: get(row, "dependee")?,
                    depender: get(row, "depender")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    // =========================================================================
    // Workflows
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn add_workflow(&self, input: CreateWorkflow) -> Result<WorkflowId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: WorkflowId = sqlx::query_scalar(
            r#"
            INSERT INTO workflow (name, params, status, type)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(input.params.to_string())
        .bind(input.status)
        .bind(&input.workflow_type)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add workflow"))?;
        tx.commit().await.map_err(db_error("commit workflow"))?;

        debug!(id, "added workflow");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, params, status, type, start_time, end_time
            FROM workflow
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get workflow"))?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_workflow(
        &self,
        id: WorkflowId,
        updates: Updates<WorkflowColumn>,
    ) -> Result<WorkflowId, StoreError> {
        self.apply_update(id, &updates).await
    }

    #[instrument(skip(self))]
    async fn list_workflows_by_name(
        &self,
        name: &str,
        last_only: bool,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        // LIMIT NULL means no limit
        let rows = sqlx::query(
            r#"
            SELECT id, name, params, status, type, start_time, end_time
            FROM workflow
            WHERE name = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(name)
        .bind(last_only.then_some(1_i64))
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("list workflows"))?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn count_workflows_by_name_and_type(&self) -> Result<Vec<WorkflowSummary>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT name, type, COUNT(*) AS count
            FROM workflow
            GROUP BY name, type
            ORDER BY name DESC, type
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("count workflows"))?;

        rows.iter()
            .map(|row| {
                Ok(WorkflowSummary {
                    name: get(row, "name")?,
                    workflow_type: get(row, "type")?,
                    count: get(row, "count")?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Steps
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name, workflow = input.workflow))]
    async fn add_step(&self, input: CreateStep) -> Result<StepId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: StepId = sqlx::query_scalar(
            r#"
            INSERT INTO step (name, workflow, status, type, params)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(input.workflow)
        .bind(input.status)
        .bind(&input.step_type)
        .bind(input.params.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add step"))?;
        tx.commit().await.map_err(db_error("commit step"))?;

        debug!(id, "added step");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_step(&self, id: StepId) -> Result<Option<StepRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, workflow, status, type, params
            FROM step
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get step"))?;

        row.as_ref().map(step_from_row).transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_step(
        &self,
        id: StepId,
        updates: Updates<StepColumn>,
    ) -> Result<StepId, StoreError> {
        self.apply_update(id, &updates).await
    }

    #[instrument(skip(self))]
    async fn list_workflow_steps(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, name, workflow, status, type, params
            FROM step
            WHERE workflow = $1
            ORDER BY id
            "#,
        )
        .bind(workflow)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("list steps"))?;

        rows.iter().map(step_from_row).collect()
    }

    // =========================================================================
    // Ports
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name, workflow = input.workflow))]
    async fn add_port(&self, input: CreatePort) -> Result<PortId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: PortId = sqlx::query_scalar(
            r#"
            INSERT INTO port (name, workflow, type, params)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(input.workflow)
        .bind(&input.port_type)
        .bind(input.params.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add port"))?;
        tx.commit().await.map_err(db_error("commit port"))?;

        debug!(id, "added port");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_port(&self, id: PortId) -> Result<Option<PortRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, workflow, type, params
            FROM port
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get port"))?;

        row.as_ref().map(port_from_row).transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_port(
        &self,
        id: PortId,
        updates: Updates<PortColumn>,
    ) -> Result<PortId, StoreError> {
        self.apply_update(id, &updates).await
    }

    #[instrument(skip(self))]
    async fn list_workflow_ports(
        &self,
        workflow: WorkflowId,
    ) -> Result<Vec<PortRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, name, workflow, type, params
            FROM port
            WHERE workflow = $1
            ORDER BY id
            "#,
        )
        .bind(workflow)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("list ports"))?;

        rows.iter().map(port_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_port_from_token(&self, token: TokenId) -> Result<Option<PortRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT port.id, port.name, port.workflow, port.type, port.params
            FROM token
            JOIN port ON token.port = port.id
            WHERE token.id = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get port from token"))?;

        row.as_ref().map(port_from_row).transpose()
    }

    // =========================================================================
    // Tokens
    // =========================================================================

    #[instrument(skip(self, input), fields(port = ?input.port, tag = %input.tag))]
    async fn add_token(&self, input: CreateToken) -> Result<TokenId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: TokenId = sqlx::query_scalar(
            r#"
            INSERT INTO token (port, tag, type, value)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(input.port)
        .bind(&input.tag)
        .bind(&input.token_type)
        .bind(&input.value)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add token"))?;
        tx.commit().await.map_err(db_error("commit token"))?;

        debug!(id, bytes = input.value.len(), "added token");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_token(&self, id: TokenId) -> Result<Option<TokenRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, port, tag, type, value
            FROM token
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get token"))?;

        row.as_ref()
            .map(|row| {
                Ok(TokenRecord {
                    id: get(row, "id")?,
                    port: get(row, "port")?,
                    token_type: get(row, "type")?,
                    tag: get(row, "tag")?,
                    value: get(row, "value")?,
                })
            })
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_port_tokens(&self, port: PortId) -> Result<Vec<TokenId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query_scalar::<_, TokenId>("SELECT id FROM token WHERE port = $1 ORDER BY id")
            .bind(port)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("list port tokens"))
    }

    // =========================================================================
    // Executions
    // =========================================================================

    #[instrument(skip(self, input), fields(step = input.step, tag = %input.tag))]
    async fn add_execution(&self, input: CreateExecution) -> Result<ExecutionId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: ExecutionId = sqlx::query_scalar(
            r#"
            INSERT INTO execution (step, tag, cmd)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(input.step)
        .bind(&input.tag)
        .bind(input.cmd.as_bytes())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add execution"))?;
        tx.commit().await.map_err(db_error("commit execution"))?;

        debug!(id, "added execution");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, step, tag, cmd, status, start_time, end_time
            FROM execution
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get execution"))?;

        row.as_ref().map(execution_from_row).transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_execution(
        &self,
        id: ExecutionId,
        updates: Updates<ExecutionColumn>,
    ) -> Result<ExecutionId, StoreError> {
        self.apply_update(id, &updates).await
    }

    #[instrument(skip(self))]
    async fn list_step_executions(
        &self,
        step: StepId,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, step, tag, cmd, status, start_time, end_time
            FROM execution
            WHERE step = $1
            ORDER BY id
            "#,
        )
        .bind(step)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("list executions"))?;

        rows.iter().map(execution_from_row).collect()
    }

    // =========================================================================
    // Deployments and targets
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn add_deployment(&self, input: CreateDeployment) -> Result<DeploymentId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: DeploymentId = sqlx::query_scalar(
            r#"
            INSERT INTO deployment (name, type, config, external, lazy, workdir, wraps)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(&input.deployment_type)
        .bind(input.config.to_string())
        .bind(input.external)
        .bind(input.lazy)
        .bind(&input.workdir)
        .bind(input.wraps.as_ref().map(|w| w.to_string()))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add deployment"))?;
        tx.commit().await.map_err(db_error("commit deployment"))?;

        debug!(id, "added deployment");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_deployment(
        &self,
        id: DeploymentId,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, type, config, external, lazy, workdir, wraps
            FROM deployment
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get deployment"))?;

        row.as_ref()
            .map(|row| {
                Ok(DeploymentRecord {
                    id: get(row, "id")?,
                    name: get(row, "name")?,
                    deployment_type: get(row, "type")?,
                    config: get_json(row, "config")?,
                    external: get(row, "external")?,
                    lazy: get(row, "lazy")?,
                    workdir: get(row, "workdir")?,
                    wraps: get_optional_json(row, "wraps")?,
                })
            })
            .transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_deployment(
        &self,
        id: DeploymentId,
        updates: Updates<DeploymentColumn>,
    ) -> Result<DeploymentId, StoreError> {
        self.apply_update(id, &updates).await
    }

    #[instrument(skip(self, input), fields(deployment = input.deployment))]
    async fn add_target(&self, input: CreateTarget) -> Result<TargetId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: TargetId = sqlx::query_scalar(
            r#"
            INSERT INTO target (params, type, deployment, locations, service, workdir)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(input.params.to_string())
        .bind(&input.target_type)
        .bind(input.deployment)
        .bind(input.locations)
        .bind(&input.service)
        .bind(&input.workdir)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add target"))?;
        tx.commit().await.map_err(db_error("commit target"))?;

        debug!(id, "added target");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_target(&self, id: TargetId) -> Result<Option<TargetRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT id, params, type, deployment, locations, service, workdir
            FROM target
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get target"))?;

        row.as_ref()
            .map(|row| {
                Ok(TargetRecord {
                    id: get(row, "id")?,
                    deployment: get(row, "deployment")?,
                    target_type: get(row, "type")?,
                    params: get_json(row, "params")?,
                    locations: get(row, "locations")?,
                    service: get(row, "service")?,
                    workdir: get(row, "workdir")?,
                })
            })
            .transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_target(
        &self,
        id: TargetId,
        updates: Updates<TargetColumn>,
    ) -> Result<TargetId, StoreError> {
        self.apply_update(id, &updates).await
    }

    // =========================================================================
    // Filters
    // =========================================================================

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn add_filter(&self, input: CreateFilter) -> Result<FilterId, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id: FilterId = sqlx::query_scalar(
            r#"
            INSERT INTO filter (name, type, config)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&input.name)
        .bind(&input.filter_type)
        .bind(input.config.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("add filter"))?;
        tx.commit().await.map_err(db_error("commit filter"))?;

        debug!(id, "added filter");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn get_filter(&self, id: FilterId) -> Result<Option<FilterRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT id, name, type, config FROM filter WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("get filter"))?;

        row.as_ref()
            .map(|row| {
                Ok(FilterRecord {
                    id: get(row, "id")?,
                    name: get(row, "name")?,
                    filter_type: get(row, "type")?,
                    config: get_json(row, "config")?,
                })
            })
            .transpose()
    }

    #[instrument(skip(self, updates))]
    async fn update_filter(
        &self,
        id: FilterId,
        updates: Updates<FilterColumn>,
    ) -> Result<FilterId, StoreError> {
        self.apply_update(id, &updates).await
    }

    // =========================================================================
    // Step/port topology
    // =========================================================================

    #[instrument(skip(self))]
    async fn record_dependency(
        &self,
        step: StepId,
        port: PortId,
        dependency_type: DependencyType,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO dependency (step, port, type, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(step)
        .bind(port)
        .bind(dependency_type.as_i32())
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(db_error("record dependency"))?;
        tx.commit().await.map_err(db_error("commit dependency"))?;

        debug!(inserted = result.rows_affected(), "recorded dependency");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn input_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.fetch_dependencies(STEP_EDGES, step, DependencyType::Input)
            .await
    }

    #[instrument(skip(self))]
    async fn output_ports_of(&self, step: StepId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.fetch_dependencies(STEP_EDGES, step, DependencyType::Output)
            .await
    }

    #[instrument(skip(self))]
    async fn input_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        // The steps feeding a port are the ones that list it as an output
        self.fetch_dependencies(PORT_EDGES, port, DependencyType::Output)
            .await
    }

    #[instrument(skip(self))]
    async fn output_steps_of(&self, port: PortId) -> Result<Vec<DependencyRecord>, StoreError> {
        self.fetch_dependencies(PORT_EDGES, port, DependencyType::Input)
            .await
    }

    // =========================================================================
    // Token provenance
    // =========================================================================

    #[instrument(skip(self, dependees), fields(count = dependees.len()))]
    async fn record_provenance(
        &self,
        dependees: &[TokenId],
        depender: TokenId,
    ) -> Result<(), StoreError> {
        if dependees.is_empty() {
            return Ok(());
        }

        let mut dependees = dependees.to_vec();
        dependees.sort_unstable();
        dependees.dedup();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO provenance (dependee, depender)
            SELECT dependee, $2 FROM UNNEST($1::bigint[]) AS dependee
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&dependees)
        .bind(depender)
        .execute(&mut *tx)
        .await
        .map_err(db_error("record provenance"))?;
        tx.commit().await.map_err(db_error("commit provenance"))?;

        debug!(inserted = result.rows_affected(), "recorded provenance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dependees_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        self.fetch_provenance(
            "SELECT dependee, depender FROM provenance WHERE depender = $1 ORDER BY dependee",
            token,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn dependers_of(&self, token: TokenId) -> Result<Vec<ProvenanceRecord>, StoreError> {
        self.fetch_provenance(
            "SELECT dependee, depender FROM provenance WHERE dependee = $1 ORDER BY depender",
            token,
        )
        .await
    }

    // =========================================================================
    // Reports
    // =========================================================================

    #[instrument(skip(self))]
    async fn reports(
        &self,
        workflow: &str,
        last_only: bool,
    ) -> Result<Vec<Vec<ReportEntry>>, StoreError> {
        if last_only {
            let mut conn = self.pool.acquire().await?;
            let rows = sqlx::query(
                r#"
                SELECT e.id, s.name, e.start_time, e.end_time
                FROM step AS s
                JOIN execution AS e ON s.id = e.step
                WHERE s.workflow = (
                    SELECT id FROM workflow WHERE name = $1 ORDER BY id DESC LIMIT 1
                )
                ORDER BY e.id
                "#,
            )
            .bind(workflow)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("get report"))?;

            let entries = rows
                .iter()
                .map(report_entry_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(vec![entries]);
        }

        // Stream inside a transaction so every group comes from one snapshot
        let mut tx = self.pool.begin().await?;
        let mut groups = ReportGroups::default();
        {
            let mut rows = sqlx::query(
                r#"
                SELECT s.workflow, e.id, s.name, e.start_time, e.end_time
                FROM step AS s
                JOIN execution AS e ON s.id = e.step
                WHERE s.workflow IN (SELECT id FROM workflow WHERE name = $1)
                ORDER BY s.workflow DESC, e.id
                "#,
            )
            .bind(workflow)
            .fetch(&mut *tx);

            while let Some(row) = rows.try_next().await.map_err(db_error("stream report"))? {
                groups.push(get(&row, "workflow")?, report_entry_from_row(&row)?);
            }
        }
        tx.commit().await.map_err(db_error("close report"))?;

        Ok(groups.into_groups())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn close(&self) {
        self.pool.close().await;
    }
}

const STEP_EDGES: &str = r#"
    SELECT step, port, type, name
    FROM dependency
    WHERE step = $1 AND type = $2
    ORDER BY port, name
"#;

const PORT_EDGES: &str = r#"
    SELECT step, port, type, name
    FROM dependency
    WHERE port = $1 AND type = $2
    ORDER BY step, name
"#;

// ============================================
// Parameter binding
// ============================================

fn bind_value<'q, C: Column>(
    query: Query<'q, Postgres, PgArguments>,
    column: C,
    value: ColumnValue,
) -> Result<Query<'q, Postgres, PgArguments>, StoreError> {
    let query = match (column.sql_type(), value) {
        (SqlType::Integer, ColumnValue::Null) => query.bind(None::<i32>),
        (SqlType::BigInt, ColumnValue::Null) => query.bind(None::<i64>),
        (SqlType::Text | SqlType::Json, ColumnValue::Null) => query.bind(None::<String>),
        (SqlType::Boolean, ColumnValue::Null) => query.bind(None::<bool>),
        (SqlType::Bytes, ColumnValue::Null) => query.bind(None::<Vec<u8>>),
        (SqlType::Integer, ColumnValue::Integer(v)) => {
            let v = i32::try_from(v).map_err(|_| StoreError::InvalidColumn {
                entity: C::ENTITY,
                reason: format!("value {} out of range for column '{}'", v, column.name()),
            })?;
            query.bind(v)
        }
        (SqlType::BigInt, ColumnValue::Integer(v)) => query.bind(v),
        (SqlType::Text | SqlType::Json, ColumnValue::Text(v)) => query.bind(v),
        (SqlType::Boolean, ColumnValue::Boolean(v)) => query.bind(v),
        (SqlType::Bytes, ColumnValue::Bytes(v)) => query.bind(v),
        (sql_type, value) => {
            return Err(StoreError::InvalidColumn {
                entity: C::ENTITY,
                reason: format!(
                    "cannot bind {:?} to {:?} column '{}'",
                    value,
                    sql_type,
                    column.name()
                ),
            })
        }
    };
    Ok(query)
}

// ============================================
// Row decoding
// ============================================

fn get<'r, T>(row: &'r PgRow, column: &'static str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(db_error("decode column"))
}

fn get_json(row: &PgRow, column: &'static str) -> Result<serde_json::Value, StoreError> {
    let text: String = get(row, column)?;
    Ok(serde_json::from_str(&text)?)
}

fn get_optional_json(
    row: &PgRow,
    column: &'static str,
) -> Result<Option<serde_json::Value>, StoreError> {
    let text: Option<String> = get(row, column)?;
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Into::into)
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowRecord, StoreError> {
    Ok(WorkflowRecord {
        id: get(row, "id")?,
        name: get(row, "name")?,
        params: get_json(row, "params")?,
        status: get(row, "status")?,
        workflow_type: get(row, "type")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    Ok(StepRecord {
        id: get(row, "id")?,
        name: get(row, "name")?,
        workflow: get(row, "workflow")?,
        status: get(row, "status")?,
        step_type: get(row, "type")?,
        params: get_json(row, "params")?,
    })
}

fn port_from_row(row: &PgRow) -> Result<PortRecord, StoreError> {
    Ok(PortRecord {
        id: get(row, "id")?,
        name: get(row, "name")?,
        workflow: get(row, "workflow")?,
        port_type: get(row, "type")?,
        params: get_json(row, "params")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    Ok(ExecutionRecord {
        id: get(row, "id")?,
        step: get(row, "step")?,
        tag: get(row, "tag")?,
        cmd: get(row, "cmd")?,
        status: get(row, "status")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
    })
}

fn dependency_from_row(row: &PgRow) -> Result<DependencyRecord, StoreError> {
    let dependency_type: i32 = get(row, "type")?;
    Ok(DependencyRecord {
        step: get(row, "step")?,
        port: get(row, "port")?,
        dependency_type: DependencyType::try_from(dependency_type)?,
        name: get(row, "name")?,
    })
}

fn report_entry_from_row(row: &PgRow) -> Result<ReportEntry, StoreError> {
    Ok(ReportEntry {
        execution: get(row, "id")?,
        step_name: get(row, "name")?,
        start_time: get(row, "start_time")?,
        end_time: get(row, "end_time")?,
    })
}
