use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::backoff::{MAIN_QUEUE, MAX_ATTEMPTS};
use courier::channel::{ChannelRegistry, InternalHandler};
use courier::config::Config;
use courier::error::Error;
use courier::job::JobState;
use courier::message::{ChannelKind, Message};
use courier::service::Service;
use courier::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
use tempfile::TempDir;

struct TmpService {
    svc: Service,
    _tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup_with(registry: ChannelRegistry) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    let config = Config {
        db_path: Some(path.path().join("courier.db").to_string_lossy().to_string()),
        ..Default::default()
    };

    TmpService {
        svc: Service::connect_with(config, registry).await.unwrap(),
        _tmpdir: path,
    }
}

fn registry_with(kind: ChannelKind, handler: InternalHandler) -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry.register(kind, Arc::new(handler));
    registry
}

fn spawn_workers(service: &Service) -> WorkerPoolHandle {
    WorkerPool::new(
        service.store().clone(),
        service.registry().clone(),
        WorkerPoolConfig::default()
            .with_concurrency(2)
            .with_poll_interval(Duration::from_millis(20)),
    )
    .spawn()
}

fn message(id: &str, channel: ChannelKind, destination: &str) -> Message {
    Message {
        id: id.to_owned(),
        channel,
        destination: destination.to_owned(),
        data: serde_json::Map::new(),
        metadata: None,
    }
}

/// Skips the store-side retry delays so a test observes multiple attempts
/// without waiting out the backoff schedule.
async fn promote_delayed(service: &Service) {
    let delayed = service
        .list_main(Some(JobState::Delayed), 0, 1000)
        .await
        .unwrap();

    for job in delayed {
        let _ = service.store().promote(MAIN_QUEUE, job.id).await;
    }
}

macro_rules! wait_for {
    ($what:expr, $done:expr) => {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if $done {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
}

#[tokio::test]
async fn internal_message_is_delivered_on_the_first_attempt() {
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let mut msg = message("m1", ChannelKind::Internal, "svc");
    msg.data = serde_json::json!({"action": "process"})
        .as_object()
        .unwrap()
        .clone();

    let receipt = service.submit(msg).await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.main.waiting, 1);

    let workers = spawn_workers(&service);

    wait_for!(
        "delivery to complete",
        service.stats().await.unwrap().main.completed == 1
    );

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.main.waiting, 0);
    assert_eq!(stats.main.completed, 1);

    let job = service.get(receipt.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.message.id, "m1");

    workers.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn always_failing_delivery_is_dead_lettered_after_max_attempts() {
    let service = setup_with(registry_with(
        ChannelKind::Http,
        InternalHandler::with_routine(|_| Err("Simulated delivery failure".to_owned())),
    ))
    .await;

    let receipt = service
        .submit(message(
            "m2",
            ChannelKind::Http,
            "https://nowhere.example/webhook",
        ))
        .await
        .unwrap();

    let workers = spawn_workers(&service);

    wait_for!("job to dead-letter", {
        promote_delayed(&service).await;
        service.stats().await.unwrap().dead_letter.waiting == 1
    });

    let entries = service.list_dead_letter(0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);

    let entry = &entries[0];
    assert_eq!(entry.id, receipt.job_id);
    assert_eq!(entry.attempt_count, MAX_ATTEMPTS);
    assert!(entry
        .last_error
        .as_deref()
        .unwrap()
        .contains("Simulated delivery failure"));
    assert!(entry.moved_to_dead_letter_at.unwrap() >= entry.first_attempted_at.unwrap());

    workers.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn requeued_dead_letter_is_delivered_as_a_fresh_job() {
    let broken = Arc::new(AtomicBool::new(true));
    let flag = broken.clone();

    let service = setup_with(registry_with(
        ChannelKind::Http,
        InternalHandler::with_routine(move |_| {
            if flag.load(Ordering::SeqCst) {
                Err("Simulated delivery failure".to_owned())
            } else {
                Ok(())
            }
        }),
    ))
    .await;

    let receipt = service
        .submit(message(
            "m2",
            ChannelKind::Http,
            "https://nowhere.example/webhook",
        ))
        .await
        .unwrap();

    let workers = spawn_workers(&service);

    wait_for!("job to dead-letter", {
        promote_delayed(&service).await;
        service.stats().await.unwrap().dead_letter.waiting == 1
    });

    // Fix the destination and requeue.
    broken.store(false, Ordering::SeqCst);

    let requeued = service.requeue(receipt.job_id).await.unwrap();
    assert_ne!(requeued.job_id, receipt.job_id);

    let entries = service.list_dead_letter(0, 10).await.unwrap();
    assert!(entries.is_empty());

    wait_for!(
        "requeued job to complete",
        service.stats().await.unwrap().main.completed == 1
    );

    let job = service.get(requeued.job_id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.is_none());
    assert_eq!(job.message.id, "m2");

    // The original record is gone, so a second requeue has nothing to act on.
    let err = service.requeue(receipt.job_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    workers.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unsupported_channel_is_rejected_synchronously() {
    // No email handler registered.
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let err = service
        .submit(message("m3", ChannelKind::Email, "x@example.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMessage { .. }));

    // The boundary rejects unknown kinds before they ever become a Message.
    assert!(serde_json::from_str::<Message>(
        r#"{"id":"m3","channel":"unknown","destination":"x","data":{}}"#
    )
    .is_err());

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.main.total(), 0);
    assert_eq!(stats.dead_letter.waiting, 0);
}

#[tokio::test]
async fn empty_fields_are_rejected_synchronously() {
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let err = service
        .submit(message("m4", ChannelKind::Internal, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMessage { .. }));

    let err = service
        .submit(message("", ChannelKind::Internal, "svc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMessage { .. }));
}

#[tokio::test]
async fn flaky_deliveries_complete_with_exactly_three_attempts() {
    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let seen = attempts.clone();

    let service = setup_with(registry_with(
        ChannelKind::Internal,
        InternalHandler::with_routine(move |m| {
            let mut seen = seen.lock().unwrap();
            let count = seen.entry(m.id.clone()).or_insert(0);
            *count += 1;
            if *count < 3 {
                Err(format!("attempt {count} refused"))
            } else {
                Ok(())
            }
        }),
    ))
    .await;

    for i in 0..10 {
        service
            .submit(message(&format!("m{i}"), ChannelKind::Internal, "svc"))
            .await
            .unwrap();
    }

    let workers = spawn_workers(&service);

    wait_for!("all deliveries to complete", {
        promote_delayed(&service).await;
        service.stats().await.unwrap().main.completed == 10
    });

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.dead_letter.waiting, 0);

    let completed = service
        .list_main(Some(JobState::Completed), 0, 100)
        .await
        .unwrap();
    assert_eq!(completed.len(), 10);
    for job in completed {
        assert_eq!(job.attempt_count, 3);
    }

    workers.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn job_counts_are_conserved_while_retrying() {
    let service = setup_with(registry_with(
        ChannelKind::Internal,
        InternalHandler::with_routine(|_| Err("down".to_owned())),
    ))
    .await;

    service
        .submit(message("m5", ChannelKind::Internal, "svc"))
        .await
        .unwrap();

    let workers = spawn_workers(&service);

    // Checkpoints inside the first retry windows: the job is always in
    // exactly one state, cycling between active and delayed.
    for step_ms in [300u64, 1200, 2000] {
        tokio::time::sleep(Duration::from_millis(step_ms)).await;

        let stats = service.stats().await.unwrap();
        let total = stats.main.total()
            + stats.dead_letter.waiting
            + stats.dead_letter.active
            + stats.dead_letter.completed;

        assert_eq!(total, 1, "job record leaked or duplicated: {stats:?}");
        assert_eq!(stats.main.completed, 0);
    }

    workers.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stats_are_stable_without_new_submissions() {
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    service
        .submit(message("m6", ChannelKind::Internal, "svc"))
        .await
        .unwrap();

    let first = service.stats().await.unwrap();
    let second = service.stats().await.unwrap();

    assert_eq!(first.main, second.main);
    assert_eq!(first.dead_letter, second.dead_letter);
}

#[tokio::test]
async fn get_reports_missing_jobs() {
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let err = service.get(4242).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn requeue_rejects_jobs_still_in_flight() {
    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let receipt = service
        .submit(message("m7", ChannelKind::Internal, "svc"))
        .await
        .unwrap();

    // Still waiting in the main queue: not a requeueable state.
    let err = service.requeue(receipt.job_id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotRequeueable {
            state: JobState::Waiting,
            ..
        }
    ));
}

#[tokio::test]
async fn removed_dead_letter_entry_is_gone_for_good() {
    let service = setup_with(registry_with(
        ChannelKind::Http,
        InternalHandler::with_routine(|_| Err("Simulated delivery failure".to_owned())),
    ))
    .await;

    let receipt = service
        .submit(message("m9", ChannelKind::Http, "https://nowhere.example/webhook"))
        .await
        .unwrap();

    let workers = spawn_workers(&service);

    wait_for!("job to dead-letter", {
        promote_delayed(&service).await;
        service.stats().await.unwrap().dead_letter.waiting == 1
    });

    service.remove(receipt.job_id).await.unwrap();

    assert!(service.list_dead_letter(0, 10).await.unwrap().is_empty());

    let err = service.requeue(receipt.job_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    workers.shutdown(Duration::from_secs(5)).await;
}

#[actix_web::test]
async fn http_api_round_trips_submission_and_inspection() {
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};
    use courier::job::JobRecord;
    use courier::service::{Stats, SubmitReceipt};

    let service = setup_with(registry_with(ChannelKind::Internal, InternalHandler::new())).await;

    let app = test::init_service(
        App::new()
            .service(courier::api::messages::service())
            .service(courier::api::admin::stats_service())
            .service(courier::api::admin::jobs_service())
            .app_data(web::Data::new(service.svc.clone())),
    )
    .await;

    // Unknown channel kinds never become a submission.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/messages")
            .set_json(serde_json::json!({
                "id": "m3",
                "channel": "unknown",
                "destination": "x",
                "data": {}
            }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/messages")
            .set_json(serde_json::json!({
                "id": "m1",
                "channel": "internal",
                "destination": "svc",
                "data": {"action": "process"}
            }))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let receipt: SubmitReceipt = test::read_body_json(resp).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/stats").to_request()).await;
    let stats: Stats = test::read_body_json(resp).await;
    assert_eq!(stats.main.waiting, 1);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri(&format!("/jobs/{}", receipt.job_id))
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
    let job: JobRecord = test::read_body_json(resp).await;
    assert_eq!(job.message.id, "m1");
    assert_eq!(job.state, JobState::Waiting);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/jobs/4242").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // A waiting main-queue job is not requeueable.
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri(&format!("/jobs/{}/requeue", receipt.job_id))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/jobs/main?state=waiting")
            .to_request(),
    )
    .await;
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn obliterate_resets_both_queues() {
    let service = setup_with(registry_with(
        ChannelKind::Internal,
        InternalHandler::with_routine(|_| Err("down".to_owned())),
    ))
    .await;

    service
        .submit(message("m8", ChannelKind::Internal, "svc"))
        .await
        .unwrap();

    service.obliterate().await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.main.total(), 0);
    assert_eq!(stats.dead_letter.waiting, 0);
}
