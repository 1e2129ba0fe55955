mod common;

use std::time::Duration as StdDuration;

use common::{Harness, config};
use jobplane_api::config::PlatformConfig;
use jobplane_api::credentials::{Role, Subject, TokenRequest, WORKER_SCOPES};
use jobplane_api::execution::MonitorOutcome;
use jobplane_executor::{
    BearerToken, ExecutorError, HandlerRegistry, HttpStatusReporter, HttpTransfer,
    ObjectTransfer, StatusReporter, WorkerTransport,
};
use jobplane_storage::{Operation, TransferError};
use jobplane_types::{StatusReport, TaskId, TaskStatus, bytes::Bytes, chrono::Duration};
use tokio::net::TcpListener;

/// Binds a listener first so pre-signed URLs and callbacks point at it.
async fn serve(mut config: PlatformConfig, registry: HandlerRegistry) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.storage.base_url = format!("http://{}", listener.local_addr().unwrap());

    let h = Harness::with_config(config, registry);
    let router = h.platform.router();
    tokio::spawn(async move {
        jobplane_api::axum::serve(listener, router).await.unwrap();
    });
    h
}

fn transfer() -> HttpTransfer {
    HttpTransfer::new(StdDuration::from_secs(5))
}

fn callback_token(h: &Harness, task_id: &TaskId) -> BearerToken {
    let token = h
        .platform
        .state
        .vendor
        .issue_with(
            TokenRequest::new(Subject::new(format!("worker:{}", task_id), Role::Worker), WORKER_SCOPES)
                .bound_to(task_id.as_str()),
        )
        .unwrap();
    BearerToken::new(token.as_str())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_transfer_reads_and_writes_through_presigned_urls() {
    let h = serve(config(), HandlerRegistry::with_builtins()).await;
    h.put_input("in/a", b"payload").await;
    let gateway = &h.platform.state.gateway;
    let read = gateway.presign("in/a", Operation::Read, Duration::minutes(5)).unwrap();
    let write = gateway.presign("out/a", Operation::Write, Duration::minutes(5)).unwrap();

    let fetched = transfer().fetch(&read).await.unwrap();
    assert_eq!(&fetched[..], b"payload");

    transfer().store(&write, Bytes::from_static(b"result")).await.unwrap();
    assert_eq!(&gateway.get_object("out/a").await.unwrap()[..], b"result");

    // A read URL grants no write.
    let err = transfer().store(&read, Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, TransferError::AccessDenied(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_url_over_http_maps_to_access_expired() {
    let h = serve(config(), HandlerRegistry::with_builtins()).await;
    h.put_input("in/a", b"payload").await;
    let read = h
        .platform
        .state
        .gateway
        .presign("in/a", Operation::Read, Duration::minutes(1))
        .unwrap();

    h.clock.advance(Duration::minutes(2));
    let err = transfer().fetch(&read).await.unwrap_err();
    assert!(matches!(err, TransferError::AccessExpired));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_reporter_posts_running_to_the_callback() {
    let h = serve(config(), HandlerRegistry::with_builtins()).await;
    let id = h.submit("builtin/echo", "a").await;
    let other = h.submit("builtin/echo", "b").await;
    let claimed = h
        .platform
        .state
        .queue
        .claim(Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.task.task_id, id);

    let reporter = HttpStatusReporter::new(h.platform.state.config.storage.base_url.clone(), &config().worker);
    let token = callback_token(&h, &id);

    let running = StatusReport::new(id.clone(), TaskStatus::Running, 1, h.clock.now());
    reporter.report(&token, &running).await.unwrap();
    assert_eq!(h.statuses.for_task(&id).len(), 1);

    // Rejected reports are not retried.
    let foreign = StatusReport::new(other.clone(), TaskStatus::Running, 0, h.clock.now());
    let err = reporter.report(&token, &foreign).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Callback(_)));
    assert!(h.statuses.for_task(&other).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_workers_complete_a_dispatched_task() {
    let mut config = config();
    config.worker.transport = WorkerTransport::Http;
    let h = serve(config, HandlerRegistry::with_builtins()).await;
    let id = h.submit("builtin/uppercase", "remote").await;

    let outcomes = h.platform.dispatcher.run_once().await.unwrap().settle().await;
    assert!(matches!(outcomes[0], MonitorOutcome::Succeeded(_)));

    let output = h.platform.state.gateway.get_object("out/remote").await.unwrap();
    assert_eq!(&output[..], b"PAYLOAD");

    let statuses: Vec<TaskStatus> = h
        .statuses
        .for_task(&id)
        .into_iter()
        .map(|report| report.status)
        .collect();
    assert_eq!(statuses, vec![TaskStatus::Running, TaskStatus::Succeeded]);
}
