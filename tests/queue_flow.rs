//! End-to-end queue flow tests
//!
//! Jobs travel through the public API only: push through the manager,
//! consume with a `Consumer`, execute with a `Worker`. Everything runs on
//! in-memory connections.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use orbit_queue::clock::{Clock, ManualClock};
use orbit_queue::config::{ConnectionConfig, Settings};
use orbit_queue::worker::FailedJob;
use orbit_queue::{
    ClassSerializer, Consumer, ConsumerOptions, Job, JobError, JobOptions, JsonSerializer,
    QueueManager, QueueService, Queueable, Worker, WorkerOptions,
};

lazy_static::lazy_static! {
    static ref SENT: Mutex<Vec<(String, u32)>> = Mutex::new(Vec::new());
    static ref FAILURES: AtomicU32 = AtomicU32::new(0);
}

/// Succeeds unless the recipient starts with "fail".
#[derive(Serialize, Deserialize, Default)]
struct SendEmail {
    to: String,
    subject: String,
    #[serde(skip)]
    options: JobOptions,
}

#[async_trait]
impl Job for SendEmail {
    fn name(&self) -> &str {
        "SendEmail"
    }

    fn options(&self) -> &JobOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut JobOptions {
        &mut self.options
    }

    async fn handle(&mut self) -> Result<(), JobError> {
        SENT.lock()
            .unwrap()
            .push((self.to.clone(), self.options.attempts));
        if self.to.starts_with("fail") {
            return Err(JobError::handler(format!("mailbox {} rejected", self.to)));
        }
        Ok(())
    }

    async fn failed(&mut self, _error: &JobError) -> Result<(), JobError> {
        FAILURES.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn email(to: &str) -> SendEmail {
    SendEmail {
        to: to.to_string(),
        subject: "Welcome".to_string(),
        options: JobOptions::default(),
    }
}

fn sent_to(prefix: &str) -> Vec<(String, u32)> {
    SENT.lock()
        .unwrap()
        .iter()
        .filter(|(to, _)| to.starts_with(prefix))
        .cloned()
        .collect()
}

fn class_manager() -> Arc<QueueManager> {
    let serializer = ClassSerializer::new();
    serializer.register::<SendEmail>("SendEmail");
    Arc::new(QueueManager::new(Arc::new(serializer)))
}

fn drain_options(queues: &[&str]) -> ConsumerOptions {
    let mut options = ConsumerOptions::new(queues.iter().map(|q| q.to_string()).collect());
    options.keep_alive = false;
    options
}

#[tokio::test]
async fn test_push_then_consume_executes_job() {
    let manager = class_manager();
    manager
        .push(email("flow-ok@example.com").on_queue("emails"))
        .await
        .unwrap();
    assert_eq!(manager.size(Some("emails"), None).await.unwrap(), 1);

    Consumer::new(manager.clone(), drain_options(&["emails"]))
        .start()
        .await
        .unwrap();

    assert_eq!(sent_to("flow-ok"), vec![("flow-ok@example.com".to_string(), 1)]);
    assert_eq!(manager.size(Some("emails"), None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_popped_job_carries_no_routing() {
    let manager = class_manager();
    manager
        .push(email("routing@example.com").on_queue("emails"))
        .await
        .unwrap();

    let job = manager.pop(Some("emails"), None).await.unwrap().unwrap();
    assert_eq!(job.options().queue_name, None);
    assert_eq!(job.options().connection_name, None);
    assert_eq!(job.options().delay_seconds, None);
    assert_eq!(job.options().attempts, 0);
    assert_eq!(job.properties().unwrap()["to"], "routing@example.com");
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_job_retries_then_fails_once() {
    let manager = class_manager();
    manager
        .push(email("fail-exhaust@example.com").with_max_attempts(3))
        .await
        .unwrap();
    let before = FAILURES.load(Ordering::SeqCst);

    let reports = Arc::new(Mutex::new(Vec::<FailedJob>::new()));
    let sink = reports.clone();
    let mut options = drain_options(&["default"]);
    options.worker = WorkerOptions::default().on_failed(move |failed| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(failed);
            Ok(())
        }
    });

    let started = tokio::time::Instant::now();
    Consumer::new(manager.clone(), options).start().await.unwrap();

    let attempts: Vec<u32> = sent_to("fail-exhaust").into_iter().map(|(_, n)| n).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(FAILURES.load(Ordering::SeqCst) > before);
    assert_eq!(started.elapsed(), Duration::from_millis(3_000));

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "SendEmail");
    assert_eq!(reports[0].properties["to"], "fail-exhaust@example.com");

    // Failed jobs are not re-queued
    assert_eq!(manager.size(None, None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delayed_job_waits_for_clock() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let serializer = ClassSerializer::with_clock(clock.clone());
    serializer.register::<SendEmail>("SendEmail");
    let manager = Arc::new(QueueManager::with_clock(Arc::new(serializer), clock.clone()));

    manager
        .push(email("delayed-1@example.com").on_queue("later").delay(60))
        .await
        .unwrap();
    manager
        .push(email("delayed-2@example.com").on_queue("later"))
        .await
        .unwrap();

    let consumer = Consumer::new(manager.clone(), drain_options(&["later"]));
    consumer.start().await.unwrap();
    assert_eq!(sent_to("delayed-").len(), 1);
    assert_eq!(sent_to("delayed-")[0].0, "delayed-2@example.com");

    clock.advance(Duration::from_secs(61));
    assert!(clock.now_millis() > 1_700_000_060_000);
    consumer.start().await.unwrap();
    assert_eq!(sent_to("delayed-1").len(), 1);
}

#[tokio::test]
async fn test_push_many_across_connections() {
    let manager = class_manager();
    manager
        .register_connection("bulk", ConnectionConfig::memory())
        .unwrap();

    let jobs = vec![
        email("bulk-1@example.com").on_queue("a"),
        email("bulk-2@example.com").on_queue("b").on_connection("bulk"),
        email("bulk-3@example.com").on_queue("a"),
    ];
    manager.push_many(&jobs).await.unwrap();

    assert_eq!(manager.size(Some("a"), None).await.unwrap(), 2);
    assert_eq!(manager.size(Some("b"), Some("bulk")).await.unwrap(), 1);

    let mut options = drain_options(&["b"]);
    options.connection = Some("bulk".into());
    Consumer::new(manager.clone(), options).start().await.unwrap();
    assert_eq!(sent_to("bulk-2").len(), 1);
    assert!(sent_to("bulk-1").is_empty());
}

#[tokio::test]
async fn test_json_serializer_jobs_are_inspectable_not_runnable() {
    let manager = QueueManager::new(Arc::new(JsonSerializer::new()));
    manager.push(email("json@example.com")).await.unwrap();

    let mut job = manager.pop(None, None).await.unwrap().unwrap();
    assert_eq!(job.name(), "SendEmail");
    assert_eq!(job.properties().unwrap()["to"], "json@example.com");

    let err = Worker::new(WorkerOptions::default().with_max_attempts(1))
        .process(job.as_mut())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot be executed"));
}

#[tokio::test]
async fn test_embedded_service_processes_pushed_jobs() {
    let mut settings = Settings::default();
    settings.run_mode = "development".into();
    settings.auto_start_worker = true;
    settings.worker = Some(orbit_queue::config::WorkerSettings {
        queues: vec!["svc".into()],
        connection: None,
        poll_interval_ms: 20,
        keep_alive: true,
        max_attempts: 1,
        timeout_seconds: Some(5),
    });

    let serializer = ClassSerializer::new();
    serializer.register::<SendEmail>("SendEmail");
    let service = QueueService::install(&settings, Arc::new(serializer))
        .await
        .unwrap();

    service
        .manager()
        .push(email("svc@example.com").on_queue("svc"))
        .await
        .unwrap();

    for _ in 0..100 {
        if !sent_to("svc@").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(sent_to("svc@").len(), 1);

    service.stop_worker().await;
    assert!(!service.is_worker_running());
}
