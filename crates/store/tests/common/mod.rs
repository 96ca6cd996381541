//! Scenarios shared by the in-memory and PostgreSQL test suites
//!
//! Every scenario takes any `Database` and uses unique names, so the same
//! checks run against each backend and never collide with earlier runs.

#![allow(dead_code)]

use anyhow::Result;
use serde_json::json;

use lineage_store::persistence::{
    CreateExecution, CreatePort, CreateStep, CreateToken, CreateWorkflow, Database,
    DependencyRecord, DependencyType, ExecutionColumn, PortId, StepColumn, StepId, TokenId,
    Updates, WorkflowId,
};
use lineage_store::StoreError;

/// Unique name for this test run
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{:016x}", prefix, rand::random::<u64>())
}

pub async fn add_workflow(db: &impl Database, name: &str) -> Result<WorkflowId> {
    Ok(db
        .add_workflow(CreateWorkflow {
            name: name.to_string(),
            params: json!({"entrypoint": "main.cwl"}),
            status: 0,
            workflow_type: "cwl".to_string(),
        })
        .await?)
}

pub async fn add_step(db: &impl Database, workflow: WorkflowId, name: &str) -> Result<StepId> {
    Ok(db
        .add_step(CreateStep {
            name: name.to_string(),
            workflow,
            status: 0,
            step_type: "ExecuteStep".to_string(),
            params: json!({"retries": 0}),
        })
        .await?)
}

pub async fn add_port(db: &impl Database, workflow: WorkflowId, name: &str) -> Result<PortId> {
    Ok(db
        .add_port(CreatePort {
            name: name.to_string(),
            workflow,
            port_type: "Port".to_string(),
            params: json!({}),
        })
        .await?)
}

pub async fn add_token(db: &impl Database, port: Option<PortId>, value: &[u8]) -> Result<TokenId> {
    Ok(db
        .add_token(CreateToken {
            port,
            token_type: "Token".to_string(),
            tag: "0".to_string(),
            value: value.to_vec(),
        })
        .await?)
}

fn steps<'a>(edges: impl IntoIterator<Item = &'a DependencyRecord>) -> Vec<StepId> {
    edges.into_iter().map(|e| e.step).collect()
}

/// W with ports P1..P3 and steps S1 (P1 → P2), S2 (P2 → P3)
pub async fn topology_end_to_end(db: &impl Database) -> Result<()> {
    let workflow = add_workflow(db, &unique_name("topology")).await?;
    let p1 = add_port(db, workflow, "/p1").await?;
    let p2 = add_port(db, workflow, "/p2").await?;
    let p3 = add_port(db, workflow, "/p3").await?;
    let s1 = add_step(db, workflow, "/s1").await?;
    let s2 = add_step(db, workflow, "/s2").await?;

    db.record_dependency(s1, p1, DependencyType::Input, "in").await?;
    db.record_dependency(s1, p2, DependencyType::Output, "out").await?;
    db.record_dependency(s2, p2, DependencyType::Input, "in").await?;
    db.record_dependency(s2, p3, DependencyType::Output, "out").await?;

    assert_eq!(steps(&db.input_steps_of(p2).await?), vec![s1]);
    assert_eq!(steps(&db.output_steps_of(p2).await?), vec![s2]);
    assert!(db.input_steps_of(p1).await?.is_empty());
    assert!(db.output_steps_of(p3).await?.is_empty());

    let inputs = db.input_ports_of(s1).await?;
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].port, p1);
    assert_eq!(inputs[0].name, "in");
    assert_eq!(inputs[0].dependency_type, DependencyType::Input);

    let outputs = db.output_ports_of(s2).await?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].port, p3);

    // Re-recording an edge is absorbed
    db.record_dependency(s1, p2, DependencyType::Output, "out").await?;
    assert_eq!(db.input_steps_of(p2).await?.len(), 1);

    let listed: Vec<_> = db
        .list_workflow_steps(workflow)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(listed, vec![s1, s2]);
    assert_eq!(db.list_workflow_ports(workflow).await?.len(), 3);
    Ok(())
}

/// Tokens A, B; B derived from A, recorded twice
pub async fn provenance_is_idempotent(db: &impl Database) -> Result<()> {
    let a = add_token(db, None, b"a").await?;
    let b = add_token(db, None, b"b").await?;

    db.record_provenance(&[a], b).await?;
    db.record_provenance(&[a], b).await?;
    db.record_provenance(&[], b).await?;

    let dependees = db.dependees_of(b).await?;
    assert_eq!(dependees.len(), 1);
    assert_eq!(dependees[0].dependee, a);
    assert_eq!(dependees[0].depender, b);

    let dependers = db.dependers_of(a).await?;
    assert_eq!(dependers.len(), 1);
    assert_eq!(dependers[0].depender, b);

    assert!(db.dependees_of(a).await?.is_empty());
    Ok(())
}

/// Token payloads survive byte for byte
pub async fn token_values_round_trip(db: &impl Database) -> Result<()> {
    let workflow = add_workflow(db, &unique_name("tokens")).await?;
    let port = add_port(db, workflow, "/out").await?;

    let values: [&[u8]; 4] = [
        b"",
        "ünïcødé ✓ 日本語 🚀".as_bytes(),
        &[0x00, 0xff, 0xfe, 0x80, 0x00],
        br#"{"class": "File", "path": "/tmp/x"}"#,
    ];

    let mut ids = Vec::new();
    for value in values {
        let id = add_token(db, Some(port), value).await?;
        let token = db.get_token(id).await?.expect("token exists");
        assert_eq!(token.value, value);
        assert_eq!(token.port, Some(port));
        ids.push(id);
    }

    assert_eq!(db.list_port_tokens(port).await?, ids);
    let owner = db.get_port_from_token(ids[0]).await?.expect("port exists");
    assert_eq!(owner.id, port);
    Ok(())
}

/// A cached read followed by an update never serves the old row
pub async fn updates_are_visible_after_cached_read(db: &impl Database) -> Result<()> {
    let workflow = add_workflow(db, &unique_name("coherence")).await?;
    let step = add_step(db, workflow, "/s").await?;

    assert_eq!(db.get_step(step).await?.expect("step exists").status, 0);

    let returned = db
        .update_step(
            step,
            Updates::new()
                .set(StepColumn::Status, 4)
                .set(StepColumn::Params, json!({"retries": 3})),
        )
        .await?;
    assert_eq!(returned, step);

    let record = db.get_step(step).await?.expect("step exists");
    assert_eq!(record.status, 4);
    assert_eq!(record.params, json!({"retries": 3}));
    assert_eq!(record.name, "/s");
    Ok(())
}

/// `update(id, {})` fails before any statement is issued
pub async fn empty_update_is_rejected(db: &impl Database) -> Result<()> {
    let workflow = add_workflow(db, &unique_name("empty")).await?;
    let step = add_step(db, workflow, "/s").await?;

    let err = db.update_step(step, Updates::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::EmptyUpdate { entity: "step", id } if id == step));

    let err = Updates::<StepColumn>::from_pairs([("id", 5)]).unwrap_err();
    assert!(matches!(err, StoreError::InvalidColumn { .. }));
    Ok(())
}

/// Inserts pointing at missing parents are rejected
pub async fn orphans_are_rejected(db: &impl Database) -> Result<()> {
    let err = add_step(db, i64::MAX, "/orphan").await.unwrap_err();
    let err = err.downcast::<StoreError>()?;
    assert!(err.is_constraint_violation(), "unexpected error: {}", err);

    let a = add_token(db, None, b"a").await?;
    let err = db.record_provenance(&[i64::MAX], a).await.unwrap_err();
    assert!(err.is_constraint_violation(), "unexpected error: {}", err);
    Ok(())
}

/// Two runs of the same workflow name, newest first
pub async fn reports_group_by_workflow(db: &impl Database) -> Result<()> {
    let name = unique_name("report");
    let older = add_workflow(db, &name).await?;
    let newer = add_workflow(db, &name).await?;
    let idle = add_workflow(db, &name).await?;

    let mut executions = Vec::new();
    for (workflow, step_name) in [(older, "/a"), (newer, "/b"), (older, "/c")] {
        let step = add_step(db, workflow, step_name).await?;
        let execution = db
            .add_execution(CreateExecution {
                step,
                tag: "0".to_string(),
                cmd: format!("run {}", step_name),
            })
            .await?;
        db.update_execution(
            execution,
            Updates::new()
                .set(ExecutionColumn::StartTime, 1_000_i64)
                .set(ExecutionColumn::EndTime, 4_000_i64)
                .set(ExecutionColumn::Status, 0),
        )
        .await?;
        executions.push(execution);
    }

    let groups = db.reports(&name, false).await?;
    // The idle run has no executions and no group
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].len(), 1);
    assert_eq!(groups[0][0].step_name, "/b");
    assert_eq!(
        groups[1].iter().map(|e| e.execution).collect::<Vec<_>>(),
        vec![executions[0], executions[2]]
    );
    assert_eq!(
        groups[1][0].duration(),
        Some(chrono::Duration::nanoseconds(3_000))
    );

    // The newest run has no executions yet
    let last = db.reports(&name, true).await?;
    assert_eq!(last.len(), 1);
    assert!(last[0].is_empty());

    assert!(db.reports(&unique_name("missing"), false).await?.is_empty());

    let listed = db.list_workflows_by_name(&name, false).await?;
    assert_eq!(
        listed.iter().map(|w| w.id).collect::<Vec<_>>(),
        vec![idle, newer, older]
    );
    Ok(())
}
