use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Error;
use crate::k8s::fixtures::{self, FakeAgent, FakeClusterApi, FakeConnector, FakeEvents};
use crate::k8s::{MonitorExit, OperationTracker, Severity};
use cassandra_core::crd::{BackupNodeStatus, CassandraBackupStatus};
use cassandra_core::sidecar::{NodeState, OperationKind, OperationState};
use cassandra_core::AppError;

const POD_0: &str = "cassandra-c1-dc1-r1-0";
const POD_1: &str = "cassandra-c1-dc1-r1-1";

struct Harness {
    api: Arc<FakeClusterApi>,
    agents: Arc<FakeConnector>,
    events: Arc<FakeEvents>,
    tracker: OperationTracker,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::new_test())
    }

    fn with_config(config: Config) -> Self {
        let (api, agents, events) = (Arc::new(FakeClusterApi::default()), Arc::new(FakeConnector::default()), Arc::new(FakeEvents::default()));
        let mut deps = fixtures::deps(&api, &agents, &events);
        deps.config = Arc::new(config);
        api.add_datacenter(fixtures::datacenter(2, &["r1"]));
        api.set_pods(vec![fixtures::pod(POD_0), fixtures::pod(POD_1)]);
        let tracker = OperationTracker::new(deps, broadcast::channel(10).0);
        Self { api, agents, events, tracker }
    }

    fn status(&self, name: &str) -> CassandraBackupStatus {
        self.api.backup(name).and_then(|backup| backup.status).unwrap_or_default()
    }
}

async fn join(monitors: Vec<JoinHandle<MonitorExit>>) -> Result<Vec<MonitorExit>> {
    let mut exits = vec![];
    for monitor in monitors {
        exits.push(monitor.await?);
    }
    Ok(exits)
}

#[tokio::test]
async fn backup_runs_to_completion_on_every_node() -> Result<()> {
    let h = Harness::new();
    let polls = vec![Some((OperationState::Running, 0.5)), Some((OperationState::Completed, 1.0))];
    let agents = vec![
        h.agents.add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(polls.clone())),
        h.agents.add(FakeAgent::new(POD_1, NodeState::Normal).with_polls(polls)),
    ];
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    let exits = join(monitors).await?;

    let expected = vec![MonitorExit::Terminal(OperationState::Completed); 2];
    assert!(exits == expected, "unexpected monitor exits, got {:?}, expected {:?}", exits, expected);
    for agent in agents.iter() {
        let started = agent.started();
        assert!(started.len() == 1, "expected one started operation, got {:?}", started);
        assert!(started[0].kind == OperationKind::Backup, "unexpected operation kind {:?}", started[0].kind);
        assert!(
            started[0].params.get("storageLocation") == Some(&serde_json::json!("s3://backups/c1")),
            "unexpected operation params {:?}",
            started[0].params
        );
    }
    let status = h.status("nightly");
    assert!(status.global_state == OperationState::Completed, "unexpected global state {:?}", status.global_state);
    assert!((status.global_progress - 1.0).abs() < f32::EPSILON, "unexpected global progress {}", status.global_progress);
    assert!(status.nodes.len() == 2, "expected two node entries, got {:?}", status.nodes);
    let node = status.node(POD_0).ok_or_else(|| anyhow::anyhow!("expected a status entry for {}", POD_0))?;
    assert!(node.operation_id.as_deref() == Some("cassandra-c1-dc1-r1-0-op-1"), "unexpected operation id {:?}", node.operation_id);
    let completed = h.events.with_reason("BackupCompleted");
    assert!(completed.len() == 2, "expected one BackupCompleted event per node, got {:?}", completed);
    assert!(h.events.with_reason("BackupFailed").is_empty(), "expected no BackupFailed events");
    Ok(())
}

#[tokio::test]
async fn backup_fails_when_any_node_fails() -> Result<()> {
    let h = Harness::new();
    h.agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    h.agents
        .add(FakeAgent::new(POD_1, NodeState::Normal).with_polls(vec![Some((OperationState::Failed, 0.3))]));
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    join(monitors).await?;

    let status = h.status("nightly");
    assert!(status.global_state == OperationState::Failed, "unexpected global state {:?}", status.global_state);
    let failed = h.events.with_reason("BackupFailed");
    assert!(failed.len() == 1, "expected exactly one BackupFailed event, got {:?}", failed);
    assert!(failed[0].severity == Severity::Warning, "unexpected severity {:?}", failed[0].severity);
    Ok(())
}

#[tokio::test]
async fn backup_skips_nodes_which_refuse_to_start() -> Result<()> {
    let h = Harness::new();
    h.agents.add(FakeAgent::refusing(POD_0));
    h.agents
        .add(FakeAgent::new(POD_1, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;

    assert!(monitors.len() == 1, "expected one monitor, got {}", monitors.len());
    join(monitors).await?;
    let status = h.status("nightly");
    assert!(status.node(POD_0).is_none(), "expected no status entry for {}", POD_0);
    assert!(status.global_state == OperationState::Completed, "unexpected global state {:?}", status.global_state);
    Ok(())
}

#[tokio::test]
async fn monitor_gives_up_on_unreachable_agent() -> Result<()> {
    let h = Harness::new();
    let agent = h.agents.add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![None]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    let exits = join(monitors).await?;

    assert!(exits == vec![MonitorExit::Unreachable], "unexpected monitor exits {:?}", exits);
    assert!(agent.finds() == 1, "expected a single poll with no tolerance, got {}", agent.finds());
    let state = h.status("nightly").node(POD_0).map(|node| node.state);
    assert!(state == Some(OperationState::Pending), "expected node to stay pending, got {:?}", state);
    Ok(())
}

#[tokio::test]
async fn monitor_tolerates_configured_poll_failures() -> Result<()> {
    let mut config = Config::new_test();
    config.backup_poll_error_tolerance = 2;
    let h = Harness::with_config(config);
    let polls = vec![None, None, Some((OperationState::Completed, 1.0))];
    let agent = h.agents.add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(polls));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    let exits = join(monitors).await?;

    assert!(exits == vec![MonitorExit::Terminal(OperationState::Completed)], "unexpected monitor exits {:?}", exits);
    assert!(agent.finds() == 3, "expected three polls, got {}", agent.finds());
    Ok(())
}

#[tokio::test]
async fn status_writes_survive_conflicts() -> Result<()> {
    let h = Harness::new();
    h.agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));
    h.api.inject_conflicts(3);

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    join(monitors).await?;

    let status = h.status("nightly");
    assert!(status.global_state == OperationState::Completed, "unexpected global state {:?}", status.global_state);
    Ok(())
}

#[tokio::test]
async fn backup_is_started_only_once() -> Result<()> {
    let h = Harness::new();
    let agent = h
        .agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let first = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    let second = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    join(first).await?;

    assert!(second.is_empty(), "expected no monitors from the second reconcile, got {}", second.len());
    assert!(agent.started().len() == 1, "expected one started operation, got {:?}", agent.started());
    Ok(())
}

#[tokio::test]
async fn backup_resumes_monitoring_recorded_operations() -> Result<()> {
    let h = Harness::new();
    let agent = h
        .agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    let mut backup = fixtures::backup("nightly");
    let mut status = CassandraBackupStatus {
        nodes: vec![
            BackupNodeStatus {
                node: POD_0.into(),
                operation_id: Some("op-7".into()),
                state: OperationState::Running,
                progress: 0.5,
            },
            BackupNodeStatus {
                node: POD_1.into(),
                operation_id: Some("op-8".into()),
                state: OperationState::Completed,
                progress: 1.0,
            },
        ],
        ..Default::default()
    };
    status.derive_global();
    backup.status = Some(status);
    h.api.add_backup(backup.clone());

    let monitors = h.tracker.reconcile(&backup).await?;
    let exits = join(monitors).await?;

    assert!(exits == vec![MonitorExit::Terminal(OperationState::Completed)], "unexpected monitor exits {:?}", exits);
    assert!(agent.started().is_empty(), "expected no new operation, got {:?}", agent.started());
    let status = h.status("nightly");
    let node = status.node(POD_0).ok_or_else(|| anyhow::anyhow!("expected a status entry for {}", POD_0))?;
    assert!(node.operation_id.as_deref() == Some("op-7"), "unexpected operation id {:?}", node.operation_id);
    assert!(status.global_state == OperationState::Completed, "unexpected global state {:?}", status.global_state);
    Ok(())
}

#[tokio::test]
async fn terminal_backup_is_left_alone() -> Result<()> {
    let h = Harness::new();
    let agent = h.agents.add(FakeAgent::new(POD_0, NodeState::Normal));
    let mut backup = fixtures::backup("nightly");
    let mut status = CassandraBackupStatus::default();
    status.record_operation(POD_0, "op-1", OperationState::Completed, 1.0);
    backup.status = Some(status);
    h.api.add_backup(backup.clone());

    let monitors = h.tracker.reconcile(&backup).await?;

    assert!(monitors.is_empty(), "expected no monitors, got {}", monitors.len());
    assert!(agent.started().is_empty() && agent.finds() == 0, "expected the agent to be left alone");
    assert!(h.tracker.tracked_len() == 0, "expected terminal backup not to be tracked, got {}", h.tracker.tracked_len());
    Ok(())
}

#[tokio::test]
async fn completed_backups_are_no_longer_tracked() -> Result<()> {
    let h = Harness::new();
    h.agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    h.agents
        .add(FakeAgent::new(POD_1, NodeState::Normal).with_polls(vec![Some((OperationState::Completed, 1.0))]));
    let names = ["b0", "b1", "b2", "b3", "b4"];
    let mut monitors = vec![];
    for name in names {
        h.api.add_backup(fixtures::backup(name));
        monitors.extend(h.tracker.reconcile(&fixtures::backup(name)).await?);
    }
    assert!(h.tracker.tracked_len() == 5, "expected 5 tracked backups, got {}", h.tracker.tracked_len());

    let exits = join(monitors).await?;
    for name in names {
        h.api.remove_backup(name);
    }

    let expected = vec![MonitorExit::Terminal(OperationState::Completed); 10];
    assert!(exits == expected, "unexpected monitor exits, got {:?}, expected {:?}", exits, expected);
    assert!(h.tracker.tracked_len() == 0, "expected no tracked backups, got {}", h.tracker.tracked_len());
    Ok(())
}

#[tokio::test]
async fn backup_with_stopped_monitors_is_resumed_on_next_reconcile() -> Result<()> {
    let h = Harness::new();
    let agent = h.agents.add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![None]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let first = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    let exits = join(first).await?;
    assert!(exits == vec![MonitorExit::Unreachable], "unexpected monitor exits {:?}", exits);
    assert!(h.tracker.tracked_len() == 0, "expected backup to be untracked, got {}", h.tracker.tracked_len());

    let backup = h.api.backup("nightly").ok_or_else(|| anyhow::anyhow!("expected backup to exist"))?;
    let second = h.tracker.reconcile(&backup).await?;

    assert!(second.len() == 1, "expected the recorded operation to be monitored again, got {}", second.len());
    join(second).await?;
    assert!(agent.started().len() == 1, "expected the backup to be started once, got {:?}", agent.started());
    Ok(())
}

#[tokio::test]
async fn monitors_stop_on_cancellation() -> Result<()> {
    let h = Harness::new();
    h.agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Running, 0.1))]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    h.tracker.cancel_all();
    let exits = join(monitors).await?;

    assert!(exits == vec![MonitorExit::Cancelled], "unexpected monitor exits {:?}", exits);
    assert!(h.events.with_reason("BackupCompleted").is_empty(), "expected no terminal events");
    Ok(())
}

#[tokio::test]
async fn monitors_stop_once_backup_is_gone() -> Result<()> {
    let h = Harness::new();
    h.agents
        .add(FakeAgent::new(POD_0, NodeState::Normal).with_polls(vec![Some((OperationState::Running, 0.1))]));
    h.api.set_pods(vec![fixtures::pod(POD_0)]);
    h.api.add_backup(fixtures::backup("nightly"));

    let monitors = h.tracker.reconcile(&fixtures::backup("nightly")).await?;
    h.api.remove_backup("nightly");
    let exits = join(monitors).await?;

    assert!(exits == vec![MonitorExit::Deleted], "unexpected monitor exits {:?}", exits);
    Ok(())
}

#[tokio::test]
async fn backup_of_missing_datacenter_fails() -> Result<()> {
    let h = Harness::new();
    let mut backup = fixtures::backup("nightly");
    backup.spec.datacenter = "dc9".into();
    h.api.add_backup(backup.clone());

    let res = h.tracker.reconcile(&backup).await;

    assert!(matches!(&res, Err(Error::App(AppError::ResourceNotFound(_)))), "expected a not found error, got {:?}", res.map(|m| m.len()));
    assert!(h.events.with_reason("DataCenterNotFound").len() == 1, "expected a DataCenterNotFound event");
    Ok(())
}
