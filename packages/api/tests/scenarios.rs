mod common;

use common::{CrashingHandler, FLAKY, Harness, SlowFirstAttempt, config, registry_with};
use jobplane_api::execution::{BatchOutcome, MonitorOutcome};
use jobplane_executor::HandlerRegistry;
use jobplane_storage::{Operation, TransferError};
use jobplane_types::{
    ErrorKind, ManualClock, NewTask, TaskStatus,
    bytes::Bytes,
    chrono::Duration,
};

#[tokio::test]
async fn two_crashes_then_success_on_third_delivery() {
    let h = Harness::new(registry_with(FLAKY, CrashingHandler { crash_until: 2 }));
    let id = h.submit(FLAKY, "t1").await;

    for attempt in 1..=2 {
        let batch = h.platform.dispatcher.run_once().await.unwrap();
        assert_eq!(batch.outcome, BatchOutcome::Dispatched(1));
        let outcomes = batch.settle().await;
        assert!(
            matches!(outcomes[0], MonitorOutcome::Crashed(_)),
            "attempt {} should crash",
            attempt
        );

        // Not claimable again until the lease lapses.
        let idle = h.platform.dispatcher.run_once().await.unwrap();
        assert_eq!(idle.outcome, BatchOutcome::Idle);

        let task = h.platform.state.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(task.attempt_count, attempt);
        h.lapse_lease();
    }

    let outcomes = h.platform.dispatcher.run_once().await.unwrap().settle().await;
    assert!(matches!(outcomes[0], MonitorOutcome::Succeeded(_)));

    let task = h.platform.state.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt_count, 3);

    let output = h.platform.state.gateway.get_object("out/t1").await.unwrap();
    assert_eq!(&output[..], b"PAYLOAD");

    let succeeded: Vec<_> = h
        .statuses
        .for_task(&id)
        .into_iter()
        .filter(|report| report.status == TaskStatus::Succeeded)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].attempt, 3);
}

#[tokio::test]
async fn repeated_crashes_end_in_dead_letter() {
    let h = Harness::new(registry_with(FLAKY, CrashingHandler { crash_until: u32::MAX }));
    let id = h.submit(FLAKY, "doomed").await;

    for _ in 0..3 {
        let outcomes = h.platform.dispatcher.run_once().await.unwrap().settle().await;
        assert!(matches!(outcomes[0], MonitorOutcome::Crashed(_)));
        h.lapse_lease();
    }

    let stats = h.platform.state.queue.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.ready, 0);

    let dead = h.platform.state.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task.task_id, id);
    assert_eq!(dead[0].task.attempt_count, 3);
    assert!(!dead[0].reason.is_empty());

    let alerts = h.alerts.alerts();
    assert!(alerts
        .iter()
        .any(|alert| alert.kind == ErrorKind::DeadLettered && alert.task_id.as_ref() == Some(&id)));

    let terminal = h.statuses.for_task(&id).pop().unwrap();
    assert_eq!(terminal.status, TaskStatus::Expired);
    assert_eq!(terminal.attempt, 3);
    assert_eq!(terminal.error_kind, Some(ErrorKind::DeadLettered));

    let batch = h.platform.dispatcher.run_once().await.unwrap();
    assert_eq!(batch.outcome, BatchOutcome::Idle);
}

#[tokio::test]
async fn handler_failures_are_retried_then_dead_lettered() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    // Not UTF-8, so the uppercase handler fails on every attempt.
    h.put_input("in/binary", b"\xff\xfe").await;
    let id = h
        .platform
        .state
        .queue
        .enqueue(NewTask {
            pipeline_ref: "builtin/uppercase".into(),
            parameters: serde_json::Value::Null,
            input_locator: "in/binary".into(),
            output_locator: "out/binary".into(),
            priority: 0,
            owner: "alice".into(),
            dedup_key: None,
            expected_duration_secs: None,
        })
        .await
        .unwrap();

    for _ in 0..2 {
        let outcomes = h.platform.dispatcher.run_once().await.unwrap().settle().await;
        assert!(matches!(outcomes[0], MonitorOutcome::Requeued(ErrorKind::ExecutionError)));
    }
    let outcomes = h.platform.dispatcher.run_once().await.unwrap().settle().await;
    assert!(matches!(outcomes[0], MonitorOutcome::DeadLettered(ErrorKind::ExecutionError)));

    let task = h.platform.state.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let last = h.statuses.for_task(&id).pop().unwrap();
    assert_eq!(last.status, TaskStatus::Failed);
    assert_eq!(last.error_kind, Some(ErrorKind::DeadLettered));
}

#[tokio::test]
async fn rerun_after_lost_acknowledgment_yields_same_output() {
    let clock = ManualClock::starting_now();
    let handler = SlowFirstAttempt {
        clock: clock.clone(),
        stall: Duration::seconds(40),
    };
    let h = Harness::build(clock, config(), registry_with(FLAKY, handler));
    let id = h.submit(FLAKY, "digest").await;

    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds <= 3, "task never settled");
        h.platform.dispatcher.run_once().await.unwrap().settle().await;
        let task = h.platform.state.queue.get(&id).await.unwrap().unwrap();
        if task.status == TaskStatus::Succeeded {
            assert_eq!(task.attempt_count, 2);
            break;
        }
    }

    let output = h.platform.state.gateway.get_object("out/digest").await.unwrap();
    let expected = blake3::hash(b"payload").to_hex().to_string();
    assert_eq!(&output[..], expected.as_bytes());

    // The lapsed first attempt was never reported as a success.
    let succeeded: Vec<_> = h
        .statuses
        .for_task(&id)
        .into_iter()
        .filter(|report| report.status == TaskStatus::Succeeded)
        .collect();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].attempt, 2);
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let submission = |owner: &str| NewTask {
        pipeline_ref: "builtin/echo".into(),
        parameters: serde_json::json!({"n": 1}),
        input_locator: "in/a".into(),
        output_locator: "out/a".into(),
        priority: 0,
        owner: owner.into(),
        dedup_key: Some("order-42".into()),
        expected_duration_secs: None,
    };

    let first = h.platform.state.queue.enqueue(submission("alice")).await.unwrap();
    let second = h.platform.state.queue.enqueue(submission("alice")).await.unwrap();
    let other = h.platform.state.queue.enqueue(submission("bob")).await.unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(h.platform.state.queue.stats().await.unwrap().ready, 2);
}

#[tokio::test]
async fn write_url_used_after_expiry_is_refused() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let url = h
        .platform
        .state
        .gateway
        .presign("out/o", Operation::Write, Duration::minutes(5))
        .unwrap();

    h.clock.advance(Duration::minutes(6));
    let err = h
        .platform
        .state
        .gateway
        .write(&url.url, Bytes::from_static(b"late"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::AccessExpired));
    assert_eq!(err.kind(), ErrorKind::AccessExpired);
}

#[tokio::test]
async fn read_url_cannot_write() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    h.put_input("in/a", b"payload").await;
    let url = h
        .platform
        .state
        .gateway
        .presign("in/a", Operation::Read, Duration::minutes(5))
        .unwrap();

    let err = h
        .platform
        .state
        .gateway
        .write(&url.url, Bytes::from_static(b"overwrite"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let body = h.platform.state.gateway.get_object("in/a").await.unwrap();
    assert_eq!(&body[..], b"payload");
}
