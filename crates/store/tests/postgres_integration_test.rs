//! Integration tests for PostgresDatabase
//!
//! Run with: POSTGRES_HOST=localhost cargo test -p lineage-store --test postgres_integration_test
//!
//! Requirements:
//! - PostgreSQL reachable with the POSTGRES_* variables (see `DatabaseConfig::from_env`)
//! - The schema is bootstrapped by the store on first use
//!
//! Every test returns early when POSTGRES_HOST is not set.

mod common;

use serde_json::json;

use lineage_store::persistence::{
    CreateDeployment, CreateExecution, CreateFilter, CreateTarget, DeploymentColumn,
    ExecutionColumn, PortColumn, TargetColumn, Updates, WorkflowColumn,
};
use lineage_store::{
    CachedDatabase, ConnectionPool, Database, DatabaseConfig, PostgresDatabase, StoreError,
};

/// Create a test store, or `None` when no database is configured
fn create_test_store() -> Option<PostgresDatabase> {
    if std::env::var("POSTGRES_HOST").is_err() {
        eprintln!("POSTGRES_HOST not set, skipping PostgreSQL test");
        return None;
    }
    Some(PostgresDatabase::new(DatabaseConfig::from_env()).expect("valid POSTGRES_* configuration"))
}

// ============================================
// Shared scenarios
// ============================================

#[test_log::test(tokio::test)]
async fn test_topology_end_to_end() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::topology_end_to_end(&store).await.unwrap();
    store.close().await;
}

#[test_log::test(tokio::test)]
async fn test_provenance_is_idempotent() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::provenance_is_idempotent(&store).await.unwrap();
    store.close().await;
}

#[tokio::test]
async fn test_token_values_round_trip() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::token_values_round_trip(&store).await.unwrap();
    store.close().await;
}

#[tokio::test]
async fn test_cached_updates_are_visible() {
    let Some(store) = create_test_store() else {
        return;
    };
    let db = CachedDatabase::new(store);
    common::updates_are_visible_after_cached_read(&db)
        .await
        .unwrap();
    db.close().await;
}

#[tokio::test]
async fn test_empty_update_is_rejected() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::empty_update_is_rejected(&store).await.unwrap();
    store.close().await;
}

#[tokio::test]
async fn test_orphans_are_rejected() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::orphans_are_rejected(&store).await.unwrap();
    store.close().await;
}

#[tokio::test]
async fn test_reports_group_by_workflow() {
    let Some(store) = create_test_store() else {
        return;
    };
    common::reports_group_by_workflow(&store).await.unwrap();
    store.close().await;
}

// ============================================
// Entity round trips
// ============================================

#[tokio::test]
async fn test_get_missing_rows_returns_none() {
    let Some(store) = create_test_store() else {
        return;
    };

    assert!(store.get_workflow(i64::MAX).await.unwrap().is_none());
    assert!(store.get_token(i64::MAX).await.unwrap().is_none());
    assert!(store.get_port_from_token(i64::MAX).await.unwrap().is_none());
    assert!(store.dependees_of(i64::MAX).await.unwrap().is_empty());
    assert!(store.list_port_tokens(i64::MAX).await.unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn test_workflow_params_and_times() {
    let Some(store) = create_test_store() else {
        return;
    };
    let name = common::unique_name("workflow");
    let id = common::add_workflow(&store, &name).await.unwrap();

    let started = chrono::Utc::now()
        .timestamp_nanos_opt()
        .expect("timestamp in range");
    store
        .update_workflow(
            id,
            Updates::new()
                .set(WorkflowColumn::Status, 1)
                .set(WorkflowColumn::StartTime, started)
                .set(WorkflowColumn::Params, json!({"nested": {"list": [1, "two", null]}})),
        )
        .await
        .unwrap();

    let record = store.get_workflow(id).await.unwrap().unwrap();
    assert_eq!(record.name, name);
    assert_eq!(record.status, 1);
    assert_eq!(record.start_time, Some(started));
    assert!(record.started_at().is_some());
    assert!(record.ended_at().is_none());
    assert_eq!(record.params, json!({"nested": {"list": [1, "two", null]}}));

    // Updating a row that does not exist acknowledges the id
    let missing = store
        .update_workflow(i64::MAX, Updates::new().set(WorkflowColumn::Status, 2))
        .await
        .unwrap();
    assert_eq!(missing, i64::MAX);

    let summaries = store.count_workflows_by_name_and_type().await.unwrap();
    let summary = summaries
        .iter()
        .find(|s| s.name == name)
        .expect("summary for workflow");
    assert_eq!(summary.count, 1);
    assert_eq!(summary.workflow_type, "cwl");
    store.close().await;
}

#[tokio::test]
async fn test_deployment_target_and_filter() {
    let Some(store) = create_test_store() else {
        return;
    };

    let deployment = store
        .add_deployment(CreateDeployment {
            name: common::unique_name("deployment"),
            deployment_type: "docker".to_string(),
            config: json!({"image": "alpine:3"}),
            external: false,
            lazy: true,
            workdir: Some("/tmp/work".to_string()),
            wraps: Some(json!({"deployment": "local", "service": "sh"})),
        })
        .await
        .unwrap();
    let target = store
        .add_target(CreateTarget {
            service: Some("svc".to_string()),
            ..CreateTarget::new(deployment, "Target", json!({"scheduling": "default"}))
        })
        .await
        .unwrap();
    let filter = store
        .add_filter(CreateFilter {
            name: common::unique_name("filter"),
            filter_type: "shuffle".to_string(),
            config: json!({}),
        })
        .await
        .unwrap();

    store
        .update_deployment(
            deployment,
            Updates::new()
                .set(DeploymentColumn::External, true)
                .set(DeploymentColumn::Workdir, None::<String>),
        )
        .await
        .unwrap();
    store
        .update_target(
            target,
            Updates::new()
                .set(TargetColumn::Locations, 3)
                .set(TargetColumn::Service, None::<String>),
        )
        .await
        .unwrap();

    let record = store.get_deployment(deployment).await.unwrap().unwrap();
    assert!(record.external);
    assert!(record.lazy);
    assert_eq!(record.workdir, None);
    assert_eq!(record.wraps, Some(json!({"deployment": "local", "service": "sh"})));

    let record = store.get_target(target).await.unwrap().unwrap();
    assert_eq!(record.deployment, deployment);
    assert_eq!(record.locations, 3);
    assert_eq!(record.service, None);
    assert_eq!(record.params, json!({"scheduling": "default"}));

    let record = store.get_filter(filter).await.unwrap().unwrap();
    assert_eq!(record.filter_type, "shuffle");

    // A free-form field map clears nullable JSON columns and sets scalars
    let updates = Updates::<DeploymentColumn>::from_pairs([
        ("wraps", json!(null)),
        ("lazy", json!(false)),
    ])
    .unwrap();
    store.update_deployment(deployment, updates).await.unwrap();
    let record = store.get_deployment(deployment).await.unwrap().unwrap();
    assert_eq!(record.wraps, None);
    assert!(!record.lazy);
    store.close().await;
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let Some(store) = create_test_store() else {
        return;
    };
    let workflow = common::add_workflow(&store, &common::unique_name("execution"))
        .await
        .unwrap();
    let step = common::add_step(&store, workflow, "/compile").await.unwrap();

    let execution = store
        .add_execution(CreateExecution {
            step,
            tag: "0.0".to_string(),
            cmd: "gcc -o out 'ünïcødé.c'".to_string(),
        })
        .await
        .unwrap();
    store
        .update_execution(
            execution,
            Updates::new()
                .set(ExecutionColumn::Status, 0)
                .set(ExecutionColumn::EndTime, 42_i64),
        )
        .await
        .unwrap();

    let record = store.get_execution(execution).await.unwrap().unwrap();
    assert_eq!(record.cmd_text(), "gcc -o out 'ünïcødé.c'");
    assert_eq!(record.status, Some(0));
    assert_eq!(record.end_time, Some(42));
    assert_eq!(record.start_time, None);

    let listed = store.list_step_executions(step).await.unwrap();
    assert_eq!(listed, vec![record]);
    store.close().await;
}

#[tokio::test]
async fn test_update_rejects_mistyped_values_before_the_engine() {
    let Some(store) = create_test_store() else {
        return;
    };
    let workflow = common::add_workflow(&store, &common::unique_name("mistyped"))
        .await
        .unwrap();
    let port = common::add_port(&store, workflow, "/p").await.unwrap();

    let err = store
        .update_port(port, Updates::new().set(PortColumn::Workflow, "not an id"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidColumn { entity: "port", .. }));

    let err = store
        .update_port(port, Updates::new().set(PortColumn::Workflow, i64::MAX))
        .await
        .unwrap_err();
    assert!(err.is_constraint_violation(), "unexpected error: {}", err);
    store.close().await;
}

// ============================================
// Pool lifecycle
// ============================================

#[tokio::test]
async fn test_store_is_usable_after_close() {
    let Some(store) = create_test_store() else {
        return;
    };

    let name = common::unique_name("reopen");
    let id = common::add_workflow(&store, &name).await.unwrap();
    assert!(store.pool().is_open().await);

    store.close().await;
    assert!(!store.pool().is_open().await);

    let newest = store.list_workflows_by_name(&name, true).await.unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].id, id);
    assert!(store.pool().is_open().await);
    store.close().await;
}

#[tokio::test]
async fn test_concurrent_schema_bootstrap() {
    if std::env::var("POSTGRES_HOST").is_err() {
        return;
    }

    // Two pools bootstrapping at once both succeed
    let first = ConnectionPool::new(DatabaseConfig::from_env()).unwrap();
    let second = ConnectionPool::new(DatabaseConfig::from_env()).unwrap();
    let (a, b) = tokio::join!(first.pool(), second.pool());
    a.unwrap();
    b.unwrap();

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let config = DatabaseConfig {
        hostname: "127.0.0.1".to_string(),
        port: 1,
        timeout: 1,
        ..DatabaseConfig::default()
    };
    let store = PostgresDatabase::new(config).unwrap();

    let err = store.get_workflow(1).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {}", err);
}
