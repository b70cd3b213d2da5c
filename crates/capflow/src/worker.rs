// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Training-worker protocol and client.
//!
//! Training runs in a separate OS process so a long batch can never stall
//! the serving path and a crash can never corrupt serving params. The
//! parent writes one length-prefixed JSON request on the child's stdin and
//! reads one length-prefixed status frame from its stdout; bulky outputs
//! (the params blob) are persisted to storage by the child and referenced,
//! never piped. Logs go to the child's stderr.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{CapflowError, Result};
use crate::shgat::{TrainExample, TrainingCandidate};

/// Maximum accepted frame size (64 MiB); anything larger is a protocol
/// violation, not a legitimate message.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// The single request message a worker receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainRequest {
    /// Scoring pool: capabilities and tools flattened for the trainer.
    pub candidates: Vec<TrainingCandidate>,
    pub examples: Vec<TrainExample>,
    pub epochs: usize,
    pub batch_size: usize,
    /// Existing params blob to fine-tune from; fresh init when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_params: Option<String>,
    /// Storage connection string for persisting the trained params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_url: Option<String>,
    /// User the params are keyed under.
    pub user_id: String,
}

/// The single status frame a worker emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainResponse {
    pub success: bool,
    pub final_loss: f64,
    pub final_accuracy: f64,
    /// Per-example TD errors (anchor only), input order.
    pub td_errors: Vec<f64>,
    pub saved_to_db: bool,
    /// Trained params blob, present only when no storage was available to
    /// persist it (keeps the pipe small in the normal path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TrainResponse {
    /// A failure frame carrying a reason.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            final_loss: 0.0,
            final_accuracy: 0.0,
            td_errors: Vec::new(),
            saved_to_db: false,
            params_blob: None,
            message: Some(message.into()),
        }
    }
}

/// Write one length-prefixed frame (u32 big-endian length, then payload).
///
/// # Errors
/// Propagates IO failures as `WorkerIo`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CapflowError::WorkerIo("frame exceeds u32 length".into()))?;
    if len > MAX_FRAME_BYTES {
        return Err(CapflowError::WorkerIo(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// # Errors
/// `WorkerIo` on EOF, short reads, or oversized frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(CapflowError::WorkerIo(format!(
            "incoming frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Mode of a training session; only one holder exists at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    /// Full-epoch cold-start training.
    Batch,
    /// One-epoch refinement over a replay batch.
    Live,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingMode::Batch => write!(f, "batch"),
            TrainingMode::Live => write!(f, "live"),
        }
    }
}

/// Process-wide training lock: `try_acquire` fails fast when any training
/// is already running, naming the holder's mode.
#[derive(Debug)]
pub struct TrainingLock {
    holder: parking_lot::Mutex<Option<TrainingMode>>,
}

impl Default for TrainingLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            holder: parking_lot::Mutex::new(None),
        }
    }

    /// Acquire the lock or fail fast with `TrainingBusy`.
    pub fn try_acquire(&self, mode: TrainingMode) -> Result<TrainingGuard<'_>> {
        let mut holder = self.holder.lock();
        if let Some(current) = *holder {
            return Err(CapflowError::TrainingBusy(current.to_string()));
        }
        *holder = Some(mode);
        Ok(TrainingGuard { lock: self })
    }

    /// The active mode, if any.
    #[must_use]
    pub fn current(&self) -> Option<TrainingMode> {
        *self.holder.lock()
    }
}

/// RAII guard releasing the training lock.
#[derive(Debug)]
pub struct TrainingGuard<'a> {
    lock: &'a TrainingLock,
}

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        *self.lock.holder.lock() = None;
    }
}

/// Client spawning the out-of-process trainer.
pub struct WorkerClient {
    /// Path to the `capflow-trainer` binary.
    binary: PathBuf,
    timeout: Duration,
}

impl WorkerClient {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run one training session in a subprocess.
    ///
    /// # Errors
    /// - `WorkerTimeout` when the deadline passes (the child is killed).
    /// - `TrainingFailed` on spawn failure, non-zero exit, or an
    ///   unparseable status frame. Serving params are untouched in every
    ///   failure mode.
    pub async fn train(&self, request: &TrainRequest) -> Result<TrainResponse> {
        let payload = serde_json::to_vec(request)?;
        info!(
            examples = request.examples.len(),
            epochs = request.epochs,
            "spawning training worker"
        );

        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CapflowError::TrainingFailed(format!("spawn failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CapflowError::TrainingFailed("worker stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapflowError::TrainingFailed("worker stdout unavailable".into()))?;

        let exchange = async {
            write_frame(&mut stdin, &payload).await?;
            drop(stdin);
            let frame = read_frame(&mut stdout).await?;
            let response: TrainResponse = serde_json::from_slice(&frame)
                .map_err(|e| CapflowError::TrainingFailed(format!("bad status frame: {e}")))?;
            let status = child
                .wait()
                .await
                .map_err(|e| CapflowError::TrainingFailed(format!("wait failed: {e}")))?;
            if !status.success() {
                return Err(CapflowError::TrainingFailed(format!(
                    "worker exited with {status}"
                )));
            }
            Ok(response)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "training worker timed out");
                Err(CapflowError::WorkerTimeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

/// Anything that can execute a training request: the subprocess client in
/// production, an in-process trainer in tests.
#[async_trait::async_trait]
pub trait TrainRunner: Send + Sync {
    /// Execute one training session.
    async fn run(&self, request: TrainRequest) -> Result<TrainResponse>;
}

#[async_trait::async_trait]
impl TrainRunner for WorkerClient {
    async fn run(&self, request: TrainRequest) -> Result<TrainResponse> {
        self.train(&request).await
    }
}

/// Drives the model's training state machine: batch training once the
/// replay buffer crosses the cold-start threshold, live one-epoch
/// refinement per replay batch afterwards. Training failures never touch
/// the serving parameters.
pub struct TrainingCoordinator {
    runner: std::sync::Arc<dyn TrainRunner>,
    model: std::sync::Arc<crate::shgat::ShgatModel>,
    traces: std::sync::Arc<crate::replay::TraceStore>,
    lock: std::sync::Arc<TrainingLock>,
    config: crate::config::TrainingConfig,
    db_url: Option<String>,
    user_id: String,
}

impl TrainingCoordinator {
    #[must_use]
    pub fn new(
        runner: std::sync::Arc<dyn TrainRunner>,
        model: std::sync::Arc<crate::shgat::ShgatModel>,
        traces: std::sync::Arc<crate::replay::TraceStore>,
        lock: std::sync::Arc<TrainingLock>,
        config: crate::config::TrainingConfig,
        db_url: Option<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            model,
            traces,
            lock,
            config,
            db_url,
            user_id: user_id.into(),
        }
    }

    /// Whether enough traces exist to leave the cold state.
    #[must_use]
    pub fn ready_to_train(&self) -> bool {
        self.traces.len() >= self.config.min_traces_for_training
    }

    /// Run one training session in the given mode.
    ///
    /// Cold models get full batch epochs; live mode refines with a single
    /// epoch over one prioritized replay batch. TD errors flow back into
    /// the replay buffer; new params are installed only on success.
    ///
    /// # Errors
    /// - `TrainingBusy` when another session holds the lock.
    /// - `TrainingFailed` / `WorkerTimeout` from the runner; the serving
    ///   model keeps its current parameters.
    pub async fn train_once(
        &self,
        candidates: Vec<crate::shgat::TrainingCandidate>,
        mode: TrainingMode,
    ) -> Result<TrainResponse> {
        let _guard = self.lock.try_acquire(mode)?;

        let (sampled, epochs) = match mode {
            TrainingMode::Batch => {
                let all = self.traces.all();
                let sampled: Vec<(uuid::Uuid, crate::trace::ExecutionTrace, f64)> =
                    all.into_iter().map(|t| (t.id, t, 1.0)).collect();
                (sampled, self.config.epochs)
            }
            TrainingMode::Live => {
                let batch = self.traces.sample_batch(self.config.batch_size);
                let sampled = batch
                    .into_iter()
                    .map(|s| (s.trace.id, s.trace, s.weight))
                    .collect();
                (sampled, self.config.live_epochs)
            }
        };

        let examples: Vec<crate::shgat::TrainExample> = sampled
            .into_iter()
            .filter_map(|(id, trace, weight)| {
                // Only traces attributable to a capability train the scorer.
                let candidate_id = trace.capability_id?.to_string();
                Some(crate::shgat::TrainExample {
                    trace_id: Some(id),
                    intent_embedding: trace.intent_embedding.clone(),
                    context_tools: trace.tools_used(),
                    candidate_id,
                    outcome: if trace.success { 1.0 } else { 0.0 },
                    negative_ids: Vec::new(),
                    weight,
                })
            })
            .collect();

        let request = TrainRequest {
            candidates,
            examples,
            epochs,
            batch_size: self.config.batch_size,
            existing_params: Some(self.model.export_params_blob()?),
            db_url: self.db_url.clone(),
            user_id: self.user_id.clone(),
        };
        let example_trace_ids: Vec<uuid::Uuid> = request
            .examples
            .iter()
            .filter_map(|e| e.trace_id)
            .collect();

        let response = self.runner.run(request).await?;
        if !response.success {
            return Err(CapflowError::TrainingFailed(
                response
                    .message
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            ));
        }

        // Hot-load whichever path carried the params back.
        if let Some(blob) = &response.params_blob {
            self.model.import_params_blob(blob)?;
        }
        self.model.set_state(match mode {
            TrainingMode::Batch => crate::shgat::TrainingState::Batch,
            TrainingMode::Live => crate::shgat::TrainingState::Live,
        });

        self.traces
            .update_priorities(&example_trace_ids, &response.td_errors);
        info!(
            ?mode,
            loss = response.final_loss,
            accuracy = response.final_accuracy,
            "training session committed"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frames").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"hello frames");
    }

    #[tokio::test]
    async fn test_frame_rejects_oversize_header() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CapflowError::WorkerIo(_)));
    }

    #[tokio::test]
    async fn test_frame_eof_is_error() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0, 0, 10, 1, 2]);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn test_training_lock_fails_fast_when_held() {
        let lock = TrainingLock::new();
        let guard = lock.try_acquire(TrainingMode::Batch).unwrap();
        let err = lock.try_acquire(TrainingMode::Live).unwrap_err();
        match err {
            CapflowError::TrainingBusy(mode) => assert_eq!(mode, "batch"),
            other => panic!("expected TrainingBusy, got {other:?}"),
        }
        drop(guard);
        assert!(lock.try_acquire(TrainingMode::Live).is_ok());
    }

    #[test]
    fn test_request_serde_round_trip() {
        let request = TrainRequest {
            candidates: Vec::new(),
            examples: Vec::new(),
            epochs: 20,
            batch_size: 32,
            existing_params: None,
            db_url: Some("host=localhost dbname=capflow".into()),
            user_id: "user-1".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"batchSize\":32"));
        let back: TrainRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epochs, 20);
    }

    #[test]
    fn test_failure_frame() {
        let response = TrainResponse::failure("no candidates");
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("no candidates"));
    }
}
