//! Integration tests for the dispatch loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use worker_dispatch::config::{ProjectSettings, ProjectTable};
use worker_dispatch::dispatch::file_source::JsonFileWorkSource;
use worker_dispatch::dispatch::{DispatchLoop, DispatchSettings, ItemOutcome, WorkSource};
use worker_dispatch::models::session::EnsureOutcome;
use worker_dispatch::models::work::WorkItem;
use worker_dispatch::{AppError, Result};

use super::test_helpers::{
    responder, stalls_after_new_session, supervisor, supervisor_config, BUSY_STATE, IDLE_STATE,
};

/// In-memory work source whose list tests can swap between cycles.
#[derive(Clone, Default)]
struct StaticSource {
    items: Arc<Mutex<Vec<WorkItem>>>,
}

impl StaticSource {
    fn with(items: Vec<WorkItem>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
        }
    }

    fn set(&self, items: Vec<WorkItem>) {
        *self.items.lock().unwrap() = items;
    }
}

impl WorkSource for StaticSource {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        let items = self.items.lock().unwrap().clone();
        Box::pin(async move { Ok(items) })
    }
}

struct FailingSource;

impl WorkSource for FailingSource {
    fn fetch(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        Box::pin(async { Err(AppError::Io("tracker unreachable".into())) })
    }
}

fn settings(stale_after: Option<Duration>) -> DispatchSettings {
    DispatchSettings {
        poll_interval: Duration::from_millis(100),
        stale_after,
    }
}

fn table(projects: Vec<ProjectSettings>) -> Arc<RwLock<ProjectTable>> {
    Arc::new(RwLock::new(ProjectTable {
        projects,
        ..ProjectTable::default()
    }))
}

fn project(id: &str, enabled: bool) -> ProjectSettings {
    ProjectSettings {
        id: id.into(),
        name: None,
        enabled,
        repo_path: None,
        provider: None,
        model: None,
        timeout_seconds: None,
        restart_cooldown_seconds: None,
    }
}

#[tokio::test]
async fn idle_worker_receives_prompt_once_per_incarnation() {
    let source = StaticSource::with(vec![WorkItem::new("ENG", "engine", "fix the build")]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source.clone()),
        table(Vec::new()),
        settings(None),
    );

    let first = dispatch.run_cycle().await.unwrap();
    assert_eq!(first.outcome_for("ENG"), Some(&ItemOutcome::Prompted));

    let second = dispatch.run_cycle().await.unwrap();
    assert_eq!(second.outcome_for("ENG"), Some(&ItemOutcome::AlreadyDelivered));

    source.set(vec![WorkItem::new("ENG", "engine", "now add tests")]);
    let third = dispatch.run_cycle().await.unwrap();
    assert_eq!(third.outcome_for("ENG"), Some(&ItemOutcome::Prompted));

    let sessions = dispatch.supervisor().list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "dispatch_ENG");

    dispatch.supervisor_mut().shutdown("test done").await;
}

#[tokio::test]
async fn disabled_projects_get_no_worker() {
    let source = StaticSource::with(vec![
        WorkItem::new("OPS", "operations", "rotate keys"),
        WorkItem::new("ENG", "engine", "fix the build"),
    ]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        table(vec![project("OPS", false)]),
        settings(None),
    );

    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.outcome_for("OPS"), Some(&ItemOutcome::Disabled));
    assert_eq!(report.outcome_for("ENG"), Some(&ItemOutcome::Prompted));
    assert_eq!(dispatch.supervisor().list_sessions().await.len(), 1);

    dispatch.supervisor_mut().shutdown("test done").await;
}

#[tokio::test]
async fn table_changes_apply_on_next_cycle() {
    let projects = table(Vec::new());
    let source = StaticSource::with(vec![WorkItem::new("ENG", "engine", "fix")]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        Arc::clone(&projects),
        settings(None),
    );

    projects.write().unwrap().projects = vec![project("ENG", false)];
    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.outcome_for("ENG"), Some(&ItemOutcome::Disabled));
}

#[tokio::test]
async fn one_item_per_project_per_cycle() {
    let source = StaticSource::with(vec![
        WorkItem::new("ENG", "engine", "first"),
        WorkItem::new("ENG", "engine", "second"),
    ]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        table(Vec::new()),
        settings(None),
    );

    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.items[0].1, ItemOutcome::Prompted);
    assert_eq!(report.items[1].1, ItemOutcome::Deferred);
    assert_eq!(report.prompted(), 1);

    dispatch.supervisor_mut().shutdown("test done").await;
}

#[tokio::test]
async fn empty_project_id_is_reported() {
    let source = StaticSource::with(vec![WorkItem::new("", "nameless", "x")]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        table(Vec::new()),
        settings(None),
    );

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.outcome_for(""), Some(&ItemOutcome::InvalidName));
}

#[tokio::test]
async fn similar_project_ids_get_separate_workers() {
    let source = StaticSource::with(vec![
        WorkItem::new("ENG.42", "dotted", "fix dotted"),
        WorkItem::new("ENG-42", "dashed", "fix dashed"),
        WorkItem::new("ENG_42", "underscored", "fix underscored"),
    ]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        table(Vec::new()),
        settings(None),
    );

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.prompted(), 3);

    let names: Vec<String> = dispatch
        .supervisor()
        .list_sessions()
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(
        names,
        ["dispatch_ENG--42", "dispatch_ENG-2e-42", "dispatch_ENG-5f-42"]
    );

    dispatch.supervisor_mut().shutdown("test done").await;
}

#[tokio::test]
async fn busy_worker_is_left_alone_until_stale() {
    let source = StaticSource::with(vec![WorkItem::new("ENG", "engine", "fix")]);
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(BUSY_STATE)),
        Box::new(source),
        table(Vec::new()),
        settings(Some(Duration::from_millis(300))),
    );

    let first = dispatch.run_cycle().await.unwrap();
    assert_eq!(first.outcome_for("ENG"), Some(&ItemOutcome::Busy));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = dispatch.run_cycle().await.unwrap();
    assert!(matches!(
        second.outcome_for("ENG"),
        Some(ItemOutcome::Restarted { reason }) if reason.contains("no worker activity")
    ));
    assert_eq!(second.restarted(), 1);

    let third = dispatch.run_cycle().await.unwrap();
    assert!(matches!(
        third.outcome_for("ENG"),
        Some(ItemOutcome::NotReady(EnsureOutcome::Skipped { .. }))
    ));
}

#[tokio::test]
async fn state_timeout_triggers_restart() {
    let mut config = supervisor_config(&stalls_after_new_session());
    config.timeout = Duration::from_millis(200);
    let sup = worker_dispatch::orchestrator::supervisor::SessionSupervisor::new(config).unwrap();

    let source = StaticSource::with(vec![WorkItem::new("ENG", "engine", "fix")]);
    let mut dispatch = DispatchLoop::new(sup, Box::new(source), table(Vec::new()), settings(None));

    let report = dispatch.run_cycle().await.unwrap();

    assert!(matches!(
        report.outcome_for("ENG"),
        Some(ItemOutcome::Restarted { reason }) if reason.contains("timed out")
    ));
    assert!(dispatch.supervisor().list_sessions().await.is_empty());
}

#[tokio::test]
async fn failed_fetch_is_an_error() {
    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(FailingSource),
        table(Vec::new()),
        settings(None),
    );

    assert!(matches!(dispatch.run_cycle().await, Err(AppError::Io(_))));
}

#[tokio::test]
async fn json_file_source_drives_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work.json");
    std::fs::write(
        &path,
        r#"[{"projectId":"ENG","projectName":"engine","prompt":"fix the build"}]"#,
    )
    .unwrap();

    let mut dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(JsonFileWorkSource::new(&path)),
        table(Vec::new()),
        settings(None),
    );

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.prompted(), 1);

    dispatch.supervisor_mut().shutdown("test done").await;
}

#[tokio::test]
async fn run_stops_on_cancel_and_shuts_workers_down() {
    let source = StaticSource::with(vec![
        WorkItem::new("ENG", "engine", "fix"),
        WorkItem::new("WEB", "web", "deploy"),
    ]);
    let dispatch = DispatchLoop::new(
        supervisor(&responder(IDLE_STATE)),
        Box::new(source),
        table(Vec::new()),
        settings(None),
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(dispatch.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    let reports = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.killed));
}
