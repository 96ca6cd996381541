//! # Lineage Store
//!
//! Persistence and provenance store for a workflow engine, backed by PostgreSQL.
//!
//! ## Features
//!
//! - **Entity store**: workflows, steps, ports, tokens, executions, deployments,
//!   targets and filters, with add / get / partial update
//! - **Topology index**: step/port edges queried from either side
//! - **Provenance graph**: token-derived-from-token edges with set semantics
//! - **Read cache**: point lookups cached per kind, invalidated on update
//! - **Reports**: per-workflow execution timelines
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CachedDatabase                          │
//! │  (one ReadCache per kind, invalidated after every update)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            PostgresDatabase / InMemoryDatabase               │
//! │  (Database trait: entities, dependency, provenance, reports)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConnectionPool                           │
//! │  (lazy sqlx pool, schema bootstrap, close and re-create)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use lineage_store::prelude::*;
//! use serde_json::json;
//!
//! let db = CachedDatabase::new(PostgresDatabase::new(DatabaseConfig::from_env())?);
//!
//! let workflow = db.add_workflow(CreateWorkflow {
//!     name: "wf".into(),
//!     params: json!({}),
//!     status: 0,
//!     workflow_type: "cwl".into(),
//! }).await?;
//!
//! db.update_workflow(workflow, Updates::new().set(WorkflowColumn::Status, 2)).await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod persistence;
pub mod pool;
pub mod registry;

pub use cache::{CacheStats, ReadCache};
pub use config::DatabaseConfig;
pub use error::StoreError;
pub use persistence::{CachedDatabase, Database, InMemoryDatabase, PostgresDatabase};
pub use pool::ConnectionPool;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::DatabaseConfig;
    pub use crate::error::StoreError;
    pub use crate::persistence::{
        CachedDatabase, CreateDeployment, CreateExecution, CreateFilter, CreatePort, CreateStep,
        CreateTarget, CreateToken, CreateWorkflow, Database, DependencyRecord, DependencyType,
        DeploymentColumn, DeploymentRecord, ExecutionColumn, ExecutionRecord, FilterColumn,
        FilterRecord, InMemoryDatabase, PortColumn, PortRecord, PostgresDatabase,
        ProvenanceRecord, ReportEntry, StepColumn, StepRecord, TargetColumn, TargetRecord,
        TokenRecord, Updates, WorkflowColumn, WorkflowRecord, WorkflowSummary,
    };
    pub use crate::registry::{RegistryError, TypeRegistry};
}
