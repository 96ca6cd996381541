//! Persistence layer of the workflow store
//!
//! This module provides:
//! - [`Database`] trait for entity, topology and provenance persistence
//! - [`PostgresDatabase`] for production
//! - [`InMemoryDatabase`] for testing
//! - [`CachedDatabase`], a read cache in front of either

mod cached;
mod columns;
mod memory;
mod postgres;
mod store;

pub use cached::CachedDatabase;
pub use columns::{
    Column, ColumnValue, DeploymentColumn, ExecutionColumn, FilterColumn, PortColumn, SqlType,
    StepColumn, TargetColumn, Updates, WorkflowColumn,
};
pub use memory::InMemoryDatabase;
pub use postgres::PostgresDatabase;
pub use store::{
    CreateDeployment, CreateExecution, CreateFilter, CreatePort, CreateStep, CreateTarget,
    CreateToken, CreateWorkflow, Database, DependencyRecord, DependencyType, DeploymentId,
    DeploymentRecord, ExecutionId, ExecutionRecord, FilterId, FilterRecord, PortId, PortRecord,
    ProvenanceRecord, ReportEntry, StepId, StepRecord, TargetId, TargetRecord, TokenId,
    TokenRecord, WorkflowId, WorkflowRecord, WorkflowSummary,
};
