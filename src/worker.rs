//! Build job dispatch
//!
//! Accepted jobs go onto an unbounded queue drained by a fixed number of
//! workers. Each job runs start to finish on one worker and its only visible
//! effect is the callback POST. Jobs beyond the worker count wait in the queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument, warn};

use crate::artifact::tag_from_host_path;
use crate::pipeline::{BuildRequest, Pipeline, PipelineFailure, PipelineResult};
use crate::Error;

/// Timeout for a single callback POST
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// A deploy job as accepted from a caller
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    /// Correlation id echoed in the callback
    #[serde(default)]
    pub request_id: String,
    /// Object storage URL of the artifact
    #[serde(default)]
    pub executor_location: String,
    /// Path segments joined into the tag
    #[serde(default)]
    pub host_path: Vec<String>,
    /// Where the result is POSTed
    #[serde(default)]
    pub callback_url: String,
}

/// Body POSTed to a job's callback URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Whether the deployment became reachable
    pub success: bool,
    /// FQDN of the deployment, empty if no tag could be derived
    pub response: String,
    /// The job's correlation id
    pub request_id: String,
    /// Failure detail, present only when a stage failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackPayload {
    fn completed(result: PipelineResult, request_id: &str) -> Self {
        Self {
            success: result.success,
            response: result.response,
            request_id: request_id.to_string(),
            error: None,
        }
    }

    fn failed(response: String, request_id: &str, detail: String) -> Self {
        Self {
            success: false,
            response,
            request_id: request_id.to_string(),
            error: Some(detail),
        }
    }
}

/// Runs one build request to completion
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Deploy the request; see [`Pipeline::run`]
    async fn deploy(&self, request: &BuildRequest) -> Result<PipelineResult, PipelineFailure>;

    /// FQDN a tag is served under
    fn fqdn(&self, tag: &str) -> String;
}

#[async_trait]
impl Deployer for Pipeline {
    async fn deploy(&self, request: &BuildRequest) -> Result<PipelineResult, PipelineFailure> {
        self.run(request).await
    }

    fn fqdn(&self, tag: &str) -> String {
        Pipeline::fqdn(self, tag)
    }
}

/// Delivers job results
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CallbackSink: Send + Sync {
    /// POST `payload` to `url`
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<(), Error>;
}

/// [`CallbackSink`] over HTTP
#[derive(Clone, Debug)]
pub struct HttpCallback {
    client: reqwest::Client,
}

impl HttpCallback {
    /// Create a sink with the default timeout
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .map_err(|e| Error::callback(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackSink for HttpCallback {
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> Result<(), Error> {
        self.client
            .post(url)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::callback(format!("POST {} failed: {}", url, e)))?;
        Ok(())
    }
}

/// Fixed-size pool of build workers
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<BuildJob>,
}

impl WorkerPool {
    /// Start `workers` workers pulling from a shared queue
    pub fn spawn(
        workers: usize,
        deployer: Arc<dyn Deployer>,
        callback: Arc<dyn CallbackSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<BuildJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        for worker in 0..workers {
            let receiver = receiver.clone();
            let deployer = deployer.clone();
            let callback = callback.clone();
            tokio::spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    let request_id = job.request_id.clone();

                    let outcome = AssertUnwindSafe(process(
                        deployer.as_ref(),
                        callback.as_ref(),
                        job,
                    ))
                    .catch_unwind()
                    .await;
                    if outcome.is_err() {
                        error!(worker, request_id = %request_id, "build job panicked");
                    }
                }
                info!(worker, "worker stopped");
            });
        }

        Self { sender }
    }

    /// Queue a job; never blocks
    pub fn submit(&self, job: BuildJob) -> Result<(), Error> {
        info!(request_id = %job.request_id, host_path = ?job.host_path, "build job queued");
        self.sender
            .send(job)
            .map_err(|_| Error::callback("worker pool is shut down"))
    }
}

#[instrument(skip_all, fields(request_id = %job.request_id))]
async fn process(deployer: &dyn Deployer, callback: &dyn CallbackSink, job: BuildJob) {
    let payload = match tag_from_host_path(&job.host_path) {
        Err(e) => CallbackPayload::failed(String::new(), &job.request_id, e.to_string()),
        Ok(tag) => {
            let request = BuildRequest {
                source_location: job.executor_location.clone(),
                tag,
            };
            match deployer.deploy(&request).await {
                Ok(result) => CallbackPayload::completed(result, &job.request_id),
                Err(failure) => {
                    warn!(
                        tag = %request.tag,
                        stage = %failure.stage,
                        error = %failure.error,
                        "pipeline failed"
                    );
                    CallbackPayload::failed(
                        deployer.fqdn(&request.tag),
                        &job.request_id,
                        failure.to_string(),
                    )
                }
            }
        }
    };

    if let Err(e) = callback.deliver(&job.callback_url, &payload).await {
        error!(url = %job.callback_url, error = %e, "callback delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineStage;
    use tokio::sync::Barrier;

    fn job(request_id: &str, host_path: &[&str]) -> BuildJob {
        BuildJob {
            request_id: request_id.to_string(),
            executor_location: "s3://models/acme/bot.zip".to_string(),
            host_path: host_path.iter().map(|s| s.to_string()).collect(),
            callback_url: "http://caller.local/done".to_string(),
        }
    }

    /// Callback sink that forwards payloads to a channel
    fn recording_sink() -> (MockCallbackSink, mpsc::UnboundedReceiver<CallbackPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = MockCallbackSink::new();
        sink.expect_deliver()
            .withf(|url, _| url == "http://caller.local/done")
            .returning(move |_, payload| {
                let _ = tx.send(payload.clone());
                Ok(())
            });
        (sink, rx)
    }

    fn fqdn(tag: &str) -> String {
        format!("{}.bots.example.com", tag)
    }

    // =========================================================================
    // Story: Results reach the caller only through the callback
    // =========================================================================

    #[tokio::test]
    async fn story_successful_job_posts_result_with_request_id() {
        let mut deployer = MockDeployer::new();
        deployer
            .expect_deploy()
            .withf(|request| request.tag == "acme-bot")
            .returning(|request| {
                Ok(PipelineResult {
                    success: true,
                    response: fqdn(&request.tag),
                })
            });
        let (sink, mut rx) = recording_sink();

        let pool = WorkerPool::spawn(2, Arc::new(deployer), Arc::new(sink));
        pool.submit(job("req-1", &["Acme", "Bot"])).unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(
            payload,
            CallbackPayload {
                success: true,
                response: "acme-bot.bots.example.com".to_string(),
                request_id: "req-1".to_string(),
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn story_stage_failure_is_reported_with_detail() {
        let mut deployer = MockDeployer::new();
        deployer.expect_deploy().returning(|_| {
            Err(PipelineFailure {
                stage: PipelineStage::Sizing,
                error: Error::precondition("training file intent_train.csv unreadable"),
            })
        });
        deployer.expect_fqdn().returning(|tag| fqdn(tag));
        let (sink, mut rx) = recording_sink();

        let pool = WorkerPool::spawn(1, Arc::new(deployer), Arc::new(sink));
        pool.submit(job("req-2", &["Acme", "Bot"])).unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(!payload.success);
        assert_eq!(payload.request_id, "req-2");
        assert!(payload.error.unwrap().starts_with("sizing failed"));
    }

    #[tokio::test]
    async fn story_empty_host_path_fails_without_deploying() {
        let mut deployer = MockDeployer::new();
        deployer.expect_deploy().never();
        let (sink, mut rx) = recording_sink();

        let pool = WorkerPool::spawn(1, Arc::new(deployer), Arc::new(sink));
        pool.submit(job("req-3", &[])).unwrap();

        let payload = rx.recv().await.unwrap();
        assert!(!payload.success);
        assert!(payload.error.is_some());
    }

    #[test]
    fn story_error_field_is_omitted_on_success() {
        let payload = CallbackPayload::completed(
            PipelineResult {
                success: true,
                response: "acme-bot.bots.example.com".to_string(),
            },
            "req-1",
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": true,
                "response": "acme-bot.bots.example.com",
                "request_id": "req-1",
            })
        );
    }

    // =========================================================================
    // Story: Pool depth bounds concurrency, not acceptance
    // =========================================================================

    /// Deployer whose runs all wait on one barrier
    struct Rendezvous {
        barrier: Barrier,
    }

    #[async_trait]
    impl Deployer for Rendezvous {
        async fn deploy(&self, request: &BuildRequest) -> Result<PipelineResult, PipelineFailure> {
            self.barrier.wait().await;
            Ok(PipelineResult {
                success: true,
                response: fqdn(&request.tag),
            })
        }

        fn fqdn(&self, tag: &str) -> String {
            fqdn(tag)
        }
    }

    #[tokio::test]
    async fn story_two_workers_run_two_jobs_at_once() {
        // Each run blocks until the other starts, so this only finishes with two workers
        let deployer = Rendezvous {
            barrier: Barrier::new(2),
        };
        let (sink, mut rx) = recording_sink();

        let pool = WorkerPool::spawn(2, Arc::new(deployer), Arc::new(sink));
        pool.submit(job("a", &["Acme", "One"])).unwrap();
        pool.submit(job("b", &["Acme", "Two"])).unwrap();

        let mut ids = vec![
            rx.recv().await.unwrap().request_id,
            rx.recv().await.unwrap().request_id,
        ];
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    /// Deployer that panics on one tag
    struct Fragile;

    #[async_trait]
    impl Deployer for Fragile {
        async fn deploy(&self, request: &BuildRequest) -> Result<PipelineResult, PipelineFailure> {
            if request.tag == "boom" {
                panic!("deployer exploded");
            }
            Ok(PipelineResult {
                success: true,
                response: fqdn(&request.tag),
            })
        }

        fn fqdn(&self, tag: &str) -> String {
            fqdn(tag)
        }
    }

    #[tokio::test]
    async fn story_panicking_job_does_not_kill_its_worker() {
        let (sink, mut rx) = recording_sink();
        let pool = WorkerPool::spawn(1, Arc::new(Fragile), Arc::new(sink));

        pool.submit(job("first", &["boom"])).unwrap();
        pool.submit(job("second", &["Acme", "Bot"])).unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.request_id, "second");
        assert!(payload.success);
    }

    #[tokio::test]
    async fn story_callback_failure_is_swallowed() {
        let mut deployer = MockDeployer::new();
        deployer.expect_deploy().returning(|request| {
            Ok(PipelineResult {
                success: true,
                response: fqdn(&request.tag),
            })
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = MockCallbackSink::new();
        sink.expect_deliver().times(2).returning(move |_, payload| {
            let _ = tx.send(payload.request_id.clone());
            Err(Error::callback("connection refused"))
        });

        let pool = WorkerPool::spawn(1, Arc::new(deployer), Arc::new(sink));
        pool.submit(job("one", &["a"])).unwrap();
        pool.submit(job("two", &["b"])).unwrap();

        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }
}
