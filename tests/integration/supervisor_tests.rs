//! Integration tests for `SessionSupervisor` lifecycle operations.

use std::time::Duration;

use worker_dispatch::models::session::{
    EnsureOutcome, IdleCheck, PromptOutcome, RestartOutcome, SessionContext, SessionPhase,
};
use worker_dispatch::orchestrator::supervisor::SessionSupervisor;
use worker_dispatch::orchestrator::workdir::WorkDir;
use worker_dispatch::AppError;

use super::test_helpers::{
    eventually, exits_after_new_session, rejects_new_session, responder, responder_with,
    stalls_after_new_session, supervisor, supervisor_config, BUSY_STATE, IDLE_STATE,
};

const NAME: &str = "dispatch_ENG-1";

fn context() -> SessionContext {
    SessionContext {
        project_id: "ENG-1".into(),
        project_name: "engine".into(),
        ..SessionContext::default()
    }
}

// ── ensure_session ──────────────────────────────────────────────────────────

#[tokio::test]
async fn ensure_is_idempotent() {
    let mut sup = supervisor(&responder(IDLE_STATE));

    let first = sup.ensure_session(NAME, &context()).await;
    let second = sup.ensure_session(NAME, &context()).await;

    assert!(matches!(first, EnsureOutcome::Created { pid: Some(_), workdir: WorkDir::Inherit }));
    assert_eq!(second, EnsureOutcome::Existed);

    let sessions = sup.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, NAME);
    assert_eq!(sessions[0].phase, SessionPhase::Ready);
    assert!(sessions[0].alive);

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn non_owned_names_are_refused_without_side_effects() {
    let mut sup = supervisor(&responder(IDLE_STATE));

    assert!(sup.is_owned(NAME));
    for name in ["other_ENG-1", "dispatch_", "dispatch_a b"] {
        assert!(!sup.is_owned(name), "{name}");
        let outcome = sup.ensure_session(name, &context()).await;
        assert!(matches!(outcome, EnsureOutcome::Refused { .. }), "{name}");
        assert!(sup.cooldowns().last_attempt(name).is_none());
    }

    assert!(matches!(
        sup.abort_and_restart("other_ENG-1", "manual").await,
        RestartOutcome::Refused { .. }
    ));
    assert!(sup.cooldowns().last_attempt("other_ENG-1").is_none());
    assert!(sup.list_sessions().await.is_empty());
}

#[tokio::test]
async fn rejected_new_session_fails_and_records_cooldown() {
    let mut sup = supervisor(&rejects_new_session());

    let outcome = sup.ensure_session(NAME, &context()).await;
    match outcome {
        EnsureOutcome::Failed { reason } => assert!(reason.contains("no model configured")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(sup.list_sessions().await.is_empty());

    let retry = sup.ensure_session(NAME, &context()).await;
    match retry {
        EnsureOutcome::Skipped { remaining, reason } => {
            assert!(remaining > Duration::from_secs(290));
            assert!(reason.contains("cooldown"), "{reason}");
        }
        other => panic!("expected skip, got {other:?}"),
    }
}

#[tokio::test]
async fn spawn_failure_is_reported_and_cooled_down() {
    let mut config = supervisor_config("");
    config.program = "/nonexistent/worker-binary".into();
    let mut sup = SessionSupervisor::new(config).unwrap();

    assert!(matches!(
        sup.ensure_session(NAME, &context()).await,
        EnsureOutcome::Failed { .. }
    ));
    assert!(sup.cooldowns().is_within_cooldown(NAME, None));
}

#[tokio::test]
async fn strict_directory_failure_skips_with_cooldown() {
    let mut config = supervisor_config(&responder(IDLE_STATE));
    config.strict_directories = true;
    let mut sup = SessionSupervisor::new(config).unwrap();

    match sup.ensure_session(NAME, &context()).await {
        EnsureOutcome::Skipped { reason, .. } => assert!(reason.contains("directory"), "{reason}"),
        other => panic!("expected skip, got {other:?}"),
    }
    assert!(sup.cooldowns().is_within_cooldown(NAME, None));
    assert!(sup.list_sessions().await.is_empty());
}

#[tokio::test]
async fn worker_runs_in_resolved_directory() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("engine")).unwrap();

    let mut config = supervisor_config(&responder(IDLE_STATE));
    config.workspace_root = Some(root.path().to_path_buf());
    let mut sup = SessionSupervisor::new(config).unwrap();

    match sup.ensure_session(NAME, &context()).await {
        EnsureOutcome::Created { workdir, .. } => {
            assert_eq!(workdir, WorkDir::ProjectUnderRoot(root.path().join("engine")));
        }
        other => panic!("expected created, got {other:?}"),
    }

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn dead_session_is_dropped_and_recreated() {
    let mut sup = supervisor(&exits_after_new_session());

    assert!(matches!(
        sup.ensure_session(NAME, &context()).await,
        EnsureOutcome::Created { .. }
    ));
    let first_generation = sup.generation(NAME).unwrap();

    let died = eventually(Duration::from_secs(5), || {
        let sessions = sup.list_sessions();
        async move { sessions.await.iter().all(|s| !s.alive) }
    })
    .await;
    assert!(died, "worker should exit after new_session");

    assert!(matches!(
        sup.ensure_session(NAME, &context()).await,
        EnsureOutcome::Created { .. }
    ));
    assert!(sup.generation(NAME).unwrap() > first_generation);

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn per_session_cooldown_override_applies() {
    let mut sup = supervisor(&responder(IDLE_STATE));
    let mut ctx = context();
    ctx.restart_cooldown = Some(Duration::from_millis(100));

    sup.ensure_session(NAME, &ctx).await;
    sup.abort_and_restart(NAME, "test").await;
    assert!(matches!(
        sup.ensure_session(NAME, &ctx).await,
        EnsureOutcome::Skipped { .. }
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(
        sup.ensure_session(NAME, &ctx).await,
        EnsureOutcome::Created { .. }
    ));

    sup.shutdown("test done").await;
}

// ── Idle gate ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn busy_worker_is_never_prompted() {
    let mut sup = supervisor(&responder(BUSY_STATE));
    sup.ensure_session(NAME, &context()).await;

    match sup.prompt_if_idle(NAME, "work").await {
        PromptOutcome::NotIdle(state) => assert!(state.is_streaming),
        other => panic!("expected not idle, got {other:?}"),
    }
    assert_eq!(sup.list_sessions().await[0].phase, SessionPhase::Busy);

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn idle_worker_is_prompted() {
    let mut sup = supervisor(&responder(IDLE_STATE));
    sup.ensure_session(NAME, &context()).await;

    assert!(matches!(sup.is_idle(NAME).await, IdleCheck::Idle(_)));
    assert!(sup.prompt_if_idle(NAME, "work").await.prompted());

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn unknown_sessions_are_not_running() {
    let mut sup = supervisor(&responder(IDLE_STATE));

    assert_eq!(sup.is_idle(NAME).await, IdleCheck::NotRunning);
    assert_eq!(sup.prompt_if_idle(NAME, "x").await, PromptOutcome::NotRunning);
    assert!(matches!(sup.get_state(NAME).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn state_timeout_is_unknown_not_busy() {
    let mut sup = supervisor(&stalls_after_new_session());
    let mut ctx = context();
    ctx.timeout = Some(Duration::from_millis(200));

    assert!(sup.ensure_session(NAME, &ctx).await.is_ready());

    match sup.prompt_if_idle(NAME, "work").await {
        PromptOutcome::Unknown { timed_out, .. } => assert!(timed_out),
        other => panic!("expected unknown, got {other:?}"),
    }

    sup.shutdown("test done").await;
}

#[tokio::test]
async fn input_request_sets_needs_input_flag() {
    let script = responder_with(
        IDLE_STATE,
        r#"printf '{"type":"extension_ui_request","id":"ui-1"}\n'"#,
    );
    let mut sup = supervisor(&script);
    sup.ensure_session(NAME, &context()).await;
    assert!(!sup.needs_input(NAME));

    assert!(sup.prompt_if_idle(NAME, "go").await.prompted());

    let flagged = eventually(Duration::from_secs(5), || {
        let flag = sup.needs_input(NAME);
        async move { flag }
    })
    .await;
    assert!(flagged);

    sup.shutdown("test done").await;
}

// ── abort_and_restart / shutdown ────────────────────────────────────────────

#[tokio::test]
async fn abort_and_restart_stops_worker_and_starts_cooldown() {
    let mut sup = supervisor(&responder(IDLE_STATE));
    sup.ensure_session(NAME, &context()).await;

    let outcome = sup.abort_and_restart(NAME, "stalled").await;

    assert_eq!(
        outcome,
        RestartOutcome::Stopped {
            aborted: true,
            killed: true
        }
    );
    assert!(sup.list_sessions().await.is_empty());
    assert!(matches!(
        sup.ensure_session(NAME, &context()).await,
        EnsureOutcome::Skipped { .. }
    ));
}

#[tokio::test]
async fn restart_without_session_still_records_cooldown() {
    let mut sup = supervisor(&responder(IDLE_STATE));

    assert_eq!(
        sup.abort_and_restart(NAME, "precaution").await,
        RestartOutcome::NotRunning
    );
    assert!(sup.cooldowns().is_within_cooldown(NAME, None));
}

#[tokio::test]
async fn shutdown_reports_every_session() {
    let mut sup = supervisor(&responder(IDLE_STATE));
    sup.ensure_session("dispatch_A", &context()).await;
    sup.ensure_session("dispatch_B", &context()).await;

    let reports = sup.shutdown("test done").await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "dispatch_A");
    assert_eq!(reports[1].name, "dispatch_B");
    assert!(reports.iter().all(|r| r.aborted && r.killed && r.error.is_none()));
    assert!(sup.list_sessions().await.is_empty());
}

#[tokio::test]
async fn shutdown_continues_past_unresponsive_workers() {
    let mut sup = supervisor(&stalls_after_new_session());
    let mut ctx = context();
    ctx.timeout = Some(Duration::from_millis(200));
    sup.ensure_session("dispatch_A", &ctx).await;
    sup.ensure_session("dispatch_B", &ctx).await;

    let reports = sup.shutdown("test done").await;

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(!report.aborted);
        assert!(report.killed);
        assert!(report.error.as_deref().is_some_and(|e| e.contains("timeout")));
    }
}
