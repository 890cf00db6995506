mod common;

use common::{next_event, wait_settled, wait_until, TestFixtures};
use pretty_assertions::assert_eq;
use shellgate_session::{CreateSessionRequest, RegistryConfig, SessionEvent};
use shellgate_terminal::MockOptions;
use shellgate_types::{
    CommandOrigin, CommandRequest, CommandState, GateError, ResourceLimits,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn named(id: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: Some(id.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_with_same_id_returns_existing_session() {
    let fixtures = TestFixtures::new();

    let first = fixtures.registry.create(named("alpha")).await.unwrap();
    let second = fixtures.registry.create(named("alpha")).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(fixtures.backend.started_count(), 1);
    assert_eq!(fixtures.registry.live_count(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_share_one_backend() {
    let fixtures = TestFixtures::with(
        common::test_policy,
        RegistryConfig::default(),
        MockOptions {
            start_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );

    let (a, b) = tokio::join!(
        fixtures.registry.create(named("beta")),
        fixtures.registry.create(named("beta"))
    );

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(fixtures.backend.started_count(), 1);
}

#[tokio::test]
async fn test_destroy_twice_is_not_an_error() {
    let fixtures = TestFixtures::new();
    let session = fixtures.registry.create(named("gamma")).await.unwrap();

    fixtures.registry.destroy("gamma").await.unwrap();
    fixtures.registry.destroy("gamma").await.unwrap();

    assert!(session.is_terminated());
    assert_eq!(fixtures.registry.live_count(), 0);
    assert_eq!(fixtures.backend.live_count(), 0);
    assert!(matches!(
        fixtures.registry.get("gamma"),
        Err(GateError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_sixth_session_exceeds_limit() {
    let fixtures = TestFixtures::new();
    for _ in 0..5 {
        fixtures.registry.create(Default::default()).await.unwrap();
    }

    let sixth = fixtures.registry.create(Default::default()).await;

    assert_eq!(sixth.unwrap_err(), GateError::ResourceLimitExceeded { limit: 5 });
    assert_eq!(fixtures.backend.started_count(), 5);
    assert_eq!(fixtures.registry.live_count(), 5);
    assert_eq!(fixtures.registry.list().len(), 5);
}

#[tokio::test]
async fn test_limit_frees_up_after_destroy() {
    let fixtures = TestFixtures::with(
        |policy| policy.max_concurrent_sessions = 1,
        RegistryConfig::default(),
        MockOptions::default(),
    );
    fixtures.registry.create(named("one")).await.unwrap();
    assert!(fixtures.registry.create(named("two")).await.is_err());

    fixtures.registry.destroy("one").await.unwrap();
    fixtures.registry.create(named("two")).await.unwrap();
}

#[tokio::test]
async fn test_failed_start_leaves_nothing_behind() {
    let fixtures = TestFixtures::with(
        common::test_policy,
        RegistryConfig::default(),
        MockOptions {
            fail_start: true,
            ..Default::default()
        },
    );

    let result = fixtures.registry.create(named("delta")).await;

    assert!(matches!(result, Err(GateError::BackendCreateFailed(_))));
    assert!(fixtures.registry.get("delta").is_err());
    assert!(fixtures.registry.list().is_empty());
    assert_eq!(fixtures.registry.live_count(), 0);

    fixtures.backend.update_options(|o| o.fail_start = false);
    fixtures.registry.create(named("delta")).await.unwrap();
}

#[tokio::test]
async fn test_shell_without_markers_still_completes_commands() {
    let fixtures = TestFixtures::with(
        common::test_policy,
        RegistryConfig::default(),
        MockOptions {
            plain_prompt: true,
            ..Default::default()
        },
    );
    let session = fixtures.registry.create(Default::default()).await.unwrap();

    let captured = tokio::time::timeout(
        Duration::from_secs(5),
        session.execute(CommandRequest::new("echo hi")),
    )
    .await
    .expect("captured command stalled")
    .unwrap();
    assert_eq!(captured.output.stdout, "hi\n");
    assert_eq!(captured.output.exit_code, Some(0));

    let typed = session
        .submit(CommandRequest::new("echo typed"), CommandOrigin::Agent)
        .await
        .unwrap();
    let done = wait_settled(&session, typed.id).await;
    assert_eq!(done.state(), CommandState::Completed);
    assert_eq!(done.exit_code, None);
}

#[tokio::test]
async fn test_workspace_outside_allowed_roots_is_refused() {
    let fixtures = TestFixtures::new();

    let result = fixtures
        .registry
        .create(CreateSessionRequest {
            working_directory: Some("/etc".into()),
            ..Default::default()
        })
        .await;

    assert!(matches!(result, Err(GateError::AccessDenied { .. })));
    assert_eq!(fixtures.registry.live_count(), 0);
}

#[tokio::test]
async fn test_session_gets_its_own_workspace() {
    let fixtures = TestFixtures::new();
    let session = fixtures
        .registry
        .create(CreateSessionRequest {
            session_id: Some("ws".to_string()),
            limits: Some(ResourceLimits::default()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(session.workspace().is_dir());
    assert!(session.workspace().starts_with(fixtures.temp_dir.path().canonicalize().unwrap()));
    assert!(session.workspace().ends_with("ws"));
}

#[tokio::test]
async fn test_wedged_backend_is_forced_within_grace() {
    let config = RegistryConfig {
        kill_grace: Duration::from_millis(200),
        ..Default::default()
    };
    let fixtures = TestFixtures::with(
        common::test_policy,
        config,
        MockOptions {
            hang_on_kill: true,
            ..Default::default()
        },
    );
    fixtures.registry.create(named("wedged")).await.unwrap();

    let started = Instant::now();
    fixtures.registry.destroy("wedged").await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fixtures.backend.live_count(), 0);
    assert_eq!(fixtures.registry.live_count(), 0);
}

#[tokio::test]
async fn test_sweep_removes_orphaned_backends_only() {
    let fixtures = TestFixtures::new();
    let session = fixtures.registry.create(named("kept")).await.unwrap();
    let orphan = fixtures.backend.inject_orphan(None);
    let stale = fixtures.backend.inject_orphan(Some("long-gone"));

    let report = fixtures.registry.sweep_orphans().await.unwrap();

    assert_eq!(report.orphans, 2);
    assert_eq!(report.sessions, 0);
    assert!(!fixtures.backend.has_instance(&orphan));
    assert!(!fixtures.backend.has_instance(&stale));
    assert!(fixtures.backend.has_instance(&session.handle().id));
}

#[tokio::test]
async fn test_sweep_destroys_sessions_past_reconnect_grace() {
    let config = RegistryConfig {
        reconnect_grace: Duration::from_millis(50),
        ..Default::default()
    };
    let fixtures = TestFixtures::with(common::test_policy, config, MockOptions::default());
    let abandoned = fixtures.registry.create(named("abandoned")).await.unwrap();
    let attached = fixtures.registry.create(named("attached")).await.unwrap();

    let gone = Uuid::new_v4();
    fixtures.registry.attach("abandoned", gone).unwrap();
    fixtures.registry.detach("abandoned", gone);
    fixtures.registry.attach("attached", Uuid::new_v4()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = fixtures.registry.sweep_orphans().await.unwrap();

    assert_eq!(report.sessions, 1);
    assert!(abandoned.is_terminated());
    assert!(!attached.is_terminated());
    assert!(fixtures.registry.get("attached").is_ok());
}

#[tokio::test]
async fn test_reattach_replaces_owner_and_cancels_detach() {
    let config = RegistryConfig {
        reconnect_grace: Duration::from_millis(50),
        ..Default::default()
    };
    let fixtures = TestFixtures::with(common::test_policy, config, MockOptions::default());
    fixtures.registry.create(named("roaming")).await.unwrap();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    fixtures.registry.attach("roaming", first).unwrap();
    fixtures.registry.detach("roaming", first);
    let (session, previous) = fixtures.registry.attach("roaming", second).unwrap();
    // A late detach from the old connection must not orphan the session
    fixtures.registry.detach("roaming", first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(previous, None);
    assert_eq!(session.owner(), Some(second));
    assert_eq!(fixtures.registry.sweep_orphans().await.unwrap().sessions, 0);
}

#[tokio::test]
async fn test_backend_crash_terminates_session_once() {
    let fixtures = TestFixtures::new();
    fixtures.registry.start_background();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    fixtures.backend.crash(session.handle()).await;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Terminated { .. })).await;
    match event {
        SessionEvent::Terminated { reason } => assert!(reason.contains("crash")),
        other => panic!("unexpected event {:?}", other),
    }
    wait_until("session removal", || fixtures.registry.get(session.id()).is_err()).await;
    assert_eq!(fixtures.registry.live_count(), 0);
    assert!(matches!(
        session.input(b"ls\r".to_vec()).await,
        Err(GateError::SessionTerminated(_))
    ));
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
            | Err(tokio::sync::broadcast::error::TryRecvError::Closed)
    ));
}

#[tokio::test]
async fn test_shutdown_all_destroys_everything() {
    let fixtures = TestFixtures::new();
    for _ in 0..3 {
        fixtures.registry.create(Default::default()).await.unwrap();
    }

    fixtures.registry.shutdown_all().await;

    assert!(fixtures.registry.list().is_empty());
    assert_eq!(fixtures.backend.live_count(), 0);
    assert_eq!(fixtures.registry.live_count(), 0);
}
