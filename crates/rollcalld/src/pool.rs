use crate::enrollment::EnrollmentStore;
use crate::ledger::AttendanceLedger;
use rollcall_core::{
    FaceDetector, MatchError, MatchOutcome, Recognizer, SignatureEncoder, SignatureGallery,
};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Identity reported when nothing was matched.
pub const UNKNOWN: &str = "Unknown";

/// Recognizer as owned by one worker thread.
pub type WorkerRecognizer = Recognizer<Box<dyn FaceDetector>, Box<dyn SignatureEncoder>>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("server busy")]
    Saturated,
    #[error("worker pool stopped")]
    Closed,
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("worker failed: {0}")]
    Panicked(String),
}

/// Result message published on `result/<group>` and returned by the direct path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionReply {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecognitionReply {
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            identity: UNKNOWN.to_string(),
            confidence: None,
            error: Some(error.into()),
        }
    }

    fn from_outcome(outcome: MatchOutcome) -> Self {
        let confidence = outcome.distance.map(|_| outcome.confidence);
        match outcome.identity {
            Some(identity) => Self {
                identity,
                confidence,
                error: None,
            },
            None => Self {
                identity: UNKNOWN.to_string(),
                confidence,
                error: outcome.reason.map(|r| r.to_string()),
            },
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity != UNKNOWN && self.confidence.is_some()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!(r#"{{"identity":"{UNKNOWN}"}}"#))
    }
}

/// Destination for results of jobs submitted without a reply channel.
pub trait ResultSink: Send + Sync {
    fn publish(&self, group: &str, reply: &RecognitionReply);
}

/// Shared state every worker reads or writes.
pub struct WorkerContext {
    pub gallery: Arc<SignatureGallery>,
    pub enrollment: Arc<EnrollmentStore>,
    pub ledger: Arc<AttendanceLedger>,
    pub sink: Arc<dyn ResultSink>,
}

enum Job {
    Recognize {
        group: String,
        image: Vec<u8>,
        /// `None` publishes the result through the sink instead.
        reply: Option<oneshot::Sender<RecognitionReply>>,
    },
    Enroll {
        group: String,
        identity: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<i64, PoolError>>,
    },
}

/// Clone-safe handle to the worker threads.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<Job>,
    workers: usize,
}

impl PoolHandle {
    /// Enqueue a recognition whose result goes to the sink. Never waits:
    /// a full queue is reported as `Saturated`.
    pub fn try_submit(&self, group: String, image: Vec<u8>) -> Result<(), PoolError> {
        self.tx
            .try_send(Job::Recognize {
                group,
                image,
                reply: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PoolError::Saturated,
                mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
            })
    }

    /// Recognize and wait for the result, waiting for queue capacity first.
    pub async fn recognize(&self, group: String, image: Vec<u8>) -> Result<RecognitionReply, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job::Recognize {
                group,
                image,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| PoolError::Closed)?;
        reply_rx.await.map_err(|_| PoolError::Closed)
    }

    /// Encode the subject face of `image` and add it to `identity`'s
    /// enrolled signatures. Returns the stored signature's id.
    pub async fn enroll(&self, group: String, identity: String, image: Vec<u8>) -> Result<i64, PoolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job::Enroll {
                group,
                identity,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PoolError::Closed)?;
        reply_rx.await.map_err(|_| PoolError::Closed)?
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Free slots in the job queue.
    pub fn queue_capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Spawn one OS thread per recognizer, all draining a queue of `queue_depth`
/// jobs. Workers exit once every handle has been dropped.
pub fn spawn_pool(
    recognizers: Vec<WorkerRecognizer>,
    queue_depth: usize,
    ctx: Arc<WorkerContext>,
) -> std::io::Result<PoolHandle> {
    let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let workers = recognizers.len();

    for (index, mut recognizer) in recognizers.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        let ctx = Arc::clone(&ctx);
        std::thread::Builder::new()
            .name(format!("rollcall-worker-{index}"))
            .spawn(move || {
                tracing::info!(worker = index, "worker started");
                loop {
                    let job = {
                        let mut rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                        rx.blocking_recv()
                    };
                    let Some(job) = job else { break };
                    run_job(&mut recognizer, &ctx, job);
                }
                tracing::info!(worker = index, "worker exiting");
            })?;
    }

    Ok(PoolHandle { tx, workers })
}

fn run_job(recognizer: &mut WorkerRecognizer, ctx: &WorkerContext, job: Job) {
    match job {
        Job::Recognize {
            group,
            image,
            reply,
        } => {
            let result = catch_unwind(AssertUnwindSafe(|| recognize(recognizer, ctx, &group, &image)))
                .unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(group = %group, reason = %reason, "recognition job panicked");
                    RecognitionReply::unknown(PoolError::Panicked(reason).to_string())
                });
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => ctx.sink.publish(&group, &result),
            }
        }
        Job::Enroll {
            group,
            identity,
            image,
            reply,
        } => {
            let result = catch_unwind(AssertUnwindSafe(|| {
                enroll(recognizer, ctx, &group, &identity, &image)
            }))
            .unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                tracing::error!(group = %group, identity = %identity, reason = %reason, "enroll job panicked");
                Err(PoolError::Panicked(reason))
            });
            let _ = reply.send(result);
        }
    }
}

fn recognize(
    recognizer: &mut WorkerRecognizer,
    ctx: &WorkerContext,
    group: &str,
    image: &[u8],
) -> RecognitionReply {
    let gallery = match ctx.gallery.load(group) {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(group, error = %e, "gallery unavailable");
            return RecognitionReply::unknown(e.to_string());
        }
    };

    let outcome = match recognizer.identify(&gallery, image) {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(group, bytes = image.len(), error = %e, "recognition failed");
            return RecognitionReply::unknown(e.to_string());
        }
    };

    let mut reply = RecognitionReply::from_outcome(outcome);
    if !reply.is_match() {
        tracing::info!(group, reason = ?reply.error, confidence = ?reply.confidence, "no identity matched");
        return reply;
    }

    let now = chrono::Local::now().naive_local();
    match ctx.ledger.record_if_absent(group, &reply.identity, now) {
        Ok(inserted) => {
            tracing::info!(group, identity = %reply.identity, confidence = ?reply.confidence, inserted, "face matched");
        }
        Err(e) => {
            tracing::error!(group, identity = %reply.identity, error = %e, "attendance not recorded");
            reply.error = Some(format!("attendance not recorded: {e}"));
        }
    }
    reply
}

fn enroll(
    recognizer: &mut WorkerRecognizer,
    ctx: &WorkerContext,
    group: &str,
    identity: &str,
    image: &[u8],
) -> Result<i64, PoolError> {
    let signature = recognizer.signature_of(image)?.ok_or(PoolError::NoFace)?;
    let id = ctx
        .enrollment
        .add_signature(group, identity, &signature)
        .map_err(|e| PoolError::Storage(e.to_string()))?;
    ctx.gallery.invalidate(group);
    tracing::info!(group, identity, id, "signature enrolled");
    Ok(id)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
