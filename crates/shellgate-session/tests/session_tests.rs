mod common;

use common::{next_event, screen, wait_for_state, wait_settled, wait_until, TestFixtures};
use pretty_assertions::assert_eq;
use shellgate_session::{RegistryConfig, SessionEvent};
use shellgate_terminal::MockOptions;
use shellgate_types::{
    CommandOrigin, CommandRequest, CommandState, ExecutionMode, GateError, Safety,
};

#[tokio::test]
async fn test_whitelisted_command_runs_without_approval_event() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let command = session
        .submit(CommandRequest::new("echo hello"), CommandOrigin::Agent)
        .await
        .unwrap();
    let done = wait_for_state(&session, command.id, CommandState::Completed).await;

    assert_eq!(done.exit_code, Some(0));
    assert!(screen(&session).contains("hello"));
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::ApprovalRequired(_)),
            "unexpected approval request"
        );
    }
}

#[tokio::test]
async fn test_nonzero_exit_marks_failed() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let command = session
        .submit(CommandRequest::new("fail 3"), CommandOrigin::Agent)
        .await
        .unwrap();
    let done = wait_settled(&session, command.id).await;

    assert_eq!(done.state(), CommandState::Failed);
    assert_eq!(done.exit_code, Some(3));
}

#[tokio::test]
async fn test_blacklisted_command_needs_approval_even_with_auto_approve() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let command = session
        .submit(CommandRequest::new("rm -rf /workspace/tmp"), CommandOrigin::Agent)
        .await
        .unwrap();

    assert_eq!(command.state(), CommandState::PendingApproval);
    assert_eq!(command.classification().safety, Safety::Dangerous);
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await;
    match event {
        SessionEvent::ApprovalRequired(request) => assert_eq!(request.command_id, command.id),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(session.pending_approvals().len(), 1);

    session.deny(command.id, Some("not today".to_string())).unwrap();
    let done = wait_for_state(&session, command.id, CommandState::Rejected).await;

    assert_eq!(done.failure_reason.as_deref(), Some("not today"));
    assert!(!fixtures.backend.written(session.handle()).contains("rm"));
    assert!(session.pending_approvals().is_empty());
}

#[tokio::test]
async fn test_confirmed_command_runs() {
    let fixtures = TestFixtures::with(
        |policy| policy.auto_approve_mode = false,
        RegistryConfig::default(),
        MockOptions::default(),
    );
    let session = fixtures.session().await;

    let command = session
        .submit(CommandRequest::new("echo approved"), CommandOrigin::Agent)
        .await
        .unwrap();
    assert_eq!(command.state(), CommandState::PendingApproval);

    session.confirm(command.id).unwrap();
    let done = wait_for_state(&session, command.id, CommandState::Completed).await;

    assert!(done.started_at.is_some());
    assert!(fixtures.backend.written(session.handle()).contains("echo approved\r"));
}

#[tokio::test]
async fn test_sequential_commands_do_not_overlap() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let first = session
        .submit(CommandRequest::new("sleep 0.2"), CommandOrigin::Agent)
        .await
        .unwrap();
    let second = session
        .submit(CommandRequest::new("echo second"), CommandOrigin::Agent)
        .await
        .unwrap();

    assert_eq!(session.command(second.id).unwrap().state(), CommandState::Approved);
    let first = wait_settled(&session, first.id).await;
    let second = wait_settled(&session, second.id).await;

    assert_eq!(first.state(), CommandState::Completed);
    assert_eq!(second.state(), CommandState::Completed);
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
}

#[tokio::test]
async fn test_independent_command_runs_alongside() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let blocker = session
        .submit(CommandRequest::new("sleep 0.5"), CommandOrigin::Agent)
        .await
        .unwrap();
    let side = session
        .submit(
            CommandRequest::new("echo beside").with_mode(ExecutionMode::Independent),
            CommandOrigin::Agent,
        )
        .await
        .unwrap();

    let side = wait_settled(&session, side.id).await;
    assert_eq!(side.state(), CommandState::Completed);
    assert_eq!(
        session.command(blocker.id).unwrap().state(),
        CommandState::Running
    );
}

#[tokio::test]
async fn test_killed_command_never_completes() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let running = session
        .submit(CommandRequest::new("hang"), CommandOrigin::Agent)
        .await
        .unwrap();
    let queued = session
        .submit(CommandRequest::new("echo queued"), CommandOrigin::Agent)
        .await
        .unwrap();
    wait_for_state(&session, running.id, CommandState::Running).await;

    let changed = session.kill_command(None).await.unwrap();
    assert_eq!(changed.len(), 2);

    // The interrupted command's exit marker must not complete anything
    let after = session
        .submit(CommandRequest::new("echo after"), CommandOrigin::Agent)
        .await
        .unwrap();
    let after = wait_settled(&session, after.id).await;

    assert_eq!(after.state(), CommandState::Completed);
    assert_eq!(after.exit_code, Some(0));
    assert_eq!(session.command(running.id).unwrap().state(), CommandState::Killed);
    assert_eq!(session.command(queued.id).unwrap().state(), CommandState::Discarded);
    assert!(fixtures.backend.written(session.handle()).contains('\x03'));
}

#[tokio::test]
async fn test_killing_captured_command_stops_backend_exec() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let side = session
        .submit(
            CommandRequest::new("hang").with_mode(ExecutionMode::Independent),
            CommandOrigin::Agent,
        )
        .await
        .unwrap();
    wait_for_state(&session, side.id, CommandState::Running).await;

    session.kill_command(Some(side.id)).await.unwrap();

    wait_until("backend exec cancelled", || fixtures.backend.cancelled_execs() == 1).await;
    assert_eq!(session.command(side.id).unwrap().state(), CommandState::Killed);
}

#[tokio::test]
async fn test_timed_out_captured_command_stops_backend_exec() {
    let fixtures = TestFixtures::with(
        |policy| {
            common::test_policy(policy);
            policy.command_timeout_ms = 150;
        },
        RegistryConfig::default(),
        MockOptions::default(),
    );
    let session = fixtures.session().await;

    let result = session.execute(CommandRequest::new("hang")).await.unwrap();

    assert_eq!(result.command.state(), CommandState::Failed);
    wait_until("backend exec cancelled", || fixtures.backend.cancelled_execs() == 1).await;
}

#[tokio::test]
async fn test_kill_of_pending_command_rejects_it() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let pending = session
        .submit(CommandRequest::new("sudo reboot"), CommandOrigin::Agent)
        .await
        .unwrap();

    session.kill_command(Some(pending.id)).await.unwrap();
    let done = wait_settled(&session, pending.id).await;

    assert_eq!(done.state(), CommandState::Rejected);
}

#[tokio::test]
async fn test_kill_unknown_command() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let unknown = uuid::Uuid::new_v4();

    let result = session.kill_command(Some(unknown)).await;

    assert_eq!(result.unwrap_err(), GateError::CommandNotFound(unknown));
}

#[tokio::test]
async fn test_agent_command_times_out() {
    let fixtures = TestFixtures::with(
        |policy| {
            common::test_policy(policy);
            policy.command_timeout_ms = 150;
        },
        RegistryConfig::default(),
        MockOptions::default(),
    );
    let session = fixtures.session().await;

    let command = session
        .submit(CommandRequest::new("hang"), CommandOrigin::Agent)
        .await
        .unwrap();
    let done = wait_settled(&session, command.id).await;

    assert_eq!(done.state(), CommandState::Failed);
    assert_eq!(done.failure_reason.as_deref(), Some("command timed out"));

    let next = session
        .submit(CommandRequest::new("true"), CommandOrigin::Agent)
        .await
        .unwrap();
    assert_eq!(wait_settled(&session, next.id).await.state(), CommandState::Completed);
}

#[tokio::test]
async fn test_working_directory_must_stay_in_workspace() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let escape = session
        .submit(
            CommandRequest::new("ls").with_working_directory("../../etc"),
            CommandOrigin::Agent,
        )
        .await;
    assert!(matches!(escape, Err(GateError::AccessDenied { .. })));

    std::fs::create_dir(session.workspace().join("sub")).unwrap();
    std::fs::write(session.workspace().join("sub/note.txt"), "inside\n").unwrap();
    let command = session
        .submit(
            CommandRequest::new("cat note.txt").with_working_directory("sub"),
            CommandOrigin::Agent,
        )
        .await
        .unwrap();
    wait_for_state(&session, command.id, CommandState::Completed).await;
    assert!(screen(&session).contains("inside"));
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let result = session
        .submit(CommandRequest::new("   "), CommandOrigin::Agent)
        .await;

    assert!(matches!(result, Err(GateError::CommandRejected { .. })));
}

#[tokio::test]
async fn test_execute_captures_output_and_exit_code() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;

    let ok = session.execute(CommandRequest::new("echo captured")).await.unwrap();
    assert_eq!(ok.output.stdout, "captured\n");
    assert_eq!(ok.output.exit_code, Some(0));
    assert_eq!(ok.command.state(), CommandState::Completed);
    assert_eq!(ok.command.origin, CommandOrigin::Api);

    let failed = session.execute(CommandRequest::new("fail 2")).await.unwrap();
    assert_eq!(failed.output.exit_code, Some(2));
    assert_eq!(failed.command.state(), CommandState::Failed);
}

#[tokio::test]
async fn test_execute_of_denied_command_reports_rejection() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let denier = {
        let session = session.clone();
        tokio::spawn(async move {
            let event = next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await;
            if let SessionEvent::ApprovalRequired(request) = event {
                session.deny(request.command_id, Some("too risky".to_string())).unwrap();
            }
        })
    };

    let result = session.execute(CommandRequest::new("rm -rf data")).await;
    denier.await.unwrap();

    assert_eq!(result.unwrap_err(), GateError::rejected("too risky"));
}

#[tokio::test]
async fn test_typed_dangerous_line_is_held_then_cleared_on_denial() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    session.input(b"rm data\r".to_vec()).await.unwrap();
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await;
    let SessionEvent::ApprovalRequired(request) = event else {
        panic!("expected approval request");
    };
    assert_eq!(request.command, "rm data");
    assert_eq!(fixtures.backend.written(session.handle()), "rm data");

    session.deny(request.command_id, None).unwrap();
    let error = next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    let SessionEvent::Error { message } = error else {
        panic!("expected error event");
    };
    assert!(message.contains("denied by user"));
    wait_until("line cleared", || {
        fixtures.backend.written(session.handle()).ends_with("\x05\x15")
    })
    .await;

    let command = session.command(request.command_id).unwrap();
    assert_eq!(command.state(), CommandState::Rejected);
    assert_eq!(command.origin, CommandOrigin::Interactive);
}

#[tokio::test]
async fn test_typed_line_runs_after_confirmation() {
    let fixtures = TestFixtures::with(
        |policy| policy.auto_approve_mode = false,
        RegistryConfig::default(),
        MockOptions::default(),
    );
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    session.input(b"echo typed\r".to_vec()).await.unwrap();
    let SessionEvent::ApprovalRequired(request) =
        next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await
    else {
        panic!("expected approval request");
    };
    assert_eq!(request.command, "echo typed");
    assert_eq!(fixtures.backend.written(session.handle()), "echo typed");

    session.confirm(request.command_id).unwrap();
    let done = wait_for_state(&session, request.command_id, CommandState::Completed).await;

    assert_eq!(done.origin, CommandOrigin::Interactive);
    assert_eq!(fixtures.backend.written(session.handle()), "echo typed\r");
}

#[tokio::test]
async fn test_typeahead_is_replayed_after_decision() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    session.input(b"rm x\recho ok\r".to_vec()).await.unwrap();
    let SessionEvent::ApprovalRequired(request) =
        next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await
    else {
        panic!("expected approval request");
    };
    assert_eq!(request.command, "rm x");
    assert!(!fixtures.backend.written(session.handle()).contains("echo"));

    session.deny(request.command_id, None).unwrap();
    wait_until("typeahead replayed", || {
        fixtures.backend.written(session.handle()) == "rm x\x05\x15echo ok\r"
    })
    .await;
    wait_until("typed command completes", || {
        session
            .commands()
            .iter()
            .any(|c| c.text == "echo ok" && c.state() == CommandState::Completed)
    })
    .await;
}

#[tokio::test]
async fn test_history_recall_cannot_be_verified() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    session.input(b"\x1b[A\r".to_vec()).await.unwrap();
    let SessionEvent::ApprovalRequired(request) =
        next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await
    else {
        panic!("expected approval request");
    };

    assert_eq!(request.safety, Safety::Unsafe);
    assert!(request.reason.contains("cannot be verified"));
}

#[tokio::test]
async fn test_confirmation_prompt_answer_needs_approval() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let asking = session
        .submit(CommandRequest::new("ask"), CommandOrigin::Agent)
        .await
        .unwrap();
    next_event(&mut events, |e| {
        matches!(e, SessionEvent::Output(chunk) if chunk.data.contains("[y/N]"))
    })
    .await;

    session.input(b"y\r".to_vec()).await.unwrap();
    let SessionEvent::ApprovalRequired(request) =
        next_event(&mut events, |e| matches!(e, SessionEvent::ApprovalRequired(_))).await
    else {
        panic!("expected approval request");
    };
    assert!(request.reason.contains("Proceed?"));

    session.confirm(request.command_id).unwrap();
    let done = wait_settled(&session, asking.id).await;

    assert_eq!(done.state(), CommandState::Completed);
    assert!(screen(&session).contains("answered: y"));
}

#[tokio::test]
async fn test_refusing_a_prompt_passes_straight_through() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let asking = session
        .submit(CommandRequest::new("ask"), CommandOrigin::Agent)
        .await
        .unwrap();
    next_event(&mut events, |e| {
        matches!(e, SessionEvent::Output(chunk) if chunk.data.contains("[y/N]"))
    })
    .await;

    session.input(b"n\r".to_vec()).await.unwrap();
    wait_settled(&session, asking.id).await;

    assert!(session.pending_approvals().is_empty());
    assert!(screen(&session).contains("answered: n"));
}

#[tokio::test]
async fn test_password_answer_is_forwarded_unechoed() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);

    let login = session
        .submit(CommandRequest::new("login"), CommandOrigin::Agent)
        .await
        .unwrap();
    next_event(&mut events, |e| {
        matches!(e, SessionEvent::Output(chunk) if chunk.data.contains("Password:"))
    })
    .await;

    session.input(b"hunter2\r".to_vec()).await.unwrap();
    wait_settled(&session, login.id).await;

    assert!(session.pending_approvals().is_empty());
    assert!(session.commands().iter().all(|c| !c.text.contains("hunter2")));
}

#[tokio::test]
async fn test_replay_returns_history_then_live_output() {
    let fixtures = TestFixtures::new();
    let session = fixtures.session().await;
    let command = session
        .submit(CommandRequest::new("echo before"), CommandOrigin::Agent)
        .await
        .unwrap();
    wait_settled(&session, command.id).await;

    let (history, mut events) = session.subscribe(true);
    let last_seq = history.last().map(|c| c.seq).unwrap();
    assert!(history.iter().any(|c| c.data.contains("before")));

    session
        .submit(CommandRequest::new("echo after"), CommandOrigin::Agent)
        .await
        .unwrap();
    let SessionEvent::Output(chunk) =
        next_event(&mut events, |e| matches!(e, SessionEvent::Output(_))).await
    else {
        unreachable!()
    };
    assert_eq!(chunk.seq, last_seq + 1);
}

#[tokio::test]
async fn test_stalled_backend_write_reports_unresponsive() {
    let fixtures = TestFixtures::new();
    fixtures.registry.start_background();
    let session = fixtures.session().await;
    let (_, mut events) = session.subscribe(false);
    fixtures.backend.update_options(|o| o.stall_writes = true);

    session.input(b"x".to_vec()).await.unwrap();

    next_event(&mut events, |e| matches!(e, SessionEvent::Terminated { .. })).await;
    assert!(session.is_terminated());
}
