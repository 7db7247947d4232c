//! Fans recognition work out across a bounded pool, one task per object id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use voxelseg_core::{Error, Result, SegmentationMask};

use crate::gateway::{RecognitionBackend, RecognitionOutcome};

/// Result of one recognition task. Failures are scoped to their object id
/// and never cancel sibling tasks.
#[derive(Debug)]
pub struct RecognitionResult {
    pub object_id: u32,
    pub outcome: Result<RecognitionOutcome>,
}

pub struct RecognitionDispatcher {
    backend: Arc<dyn RecognitionBackend>,
    max_workers: usize,
}

impl RecognitionDispatcher {
    pub fn new(backend: Arc<dyn RecognitionBackend>, max_workers: usize) -> Self {
        Self {
            backend,
            max_workers: max_workers.max(1),
        }
    }

    /// Submit one task per distinct nonzero object id in `mask`.
    ///
    /// The pool is bounded by `min(max_workers, cores, tasks)`; every task
    /// receives its own copy of the mask so tasks share no mutable state.
    /// Output order is unspecified; callers key by object id.
    pub async fn dispatch(
        &self,
        mask: &SegmentationMask,
        geometry_path: &Path,
    ) -> Vec<RecognitionResult> {
        let object_ids = mask.distinct_objects();
        if object_ids.is_empty() {
            return Vec::new();
        }

        let workers = self
            .max_workers
            .min(num_cpus::get())
            .min(object_ids.len())
            .max(1);
        info!(
            objects = object_ids.len(),
            workers, "Dispatching recognition tasks"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(object_ids.len());
        for object_id in object_ids {
            let permit_source = semaphore.clone();
            let backend = self.backend.clone();
            let task_mask = mask.clone();
            let path: PathBuf = geometry_path.to_path_buf();
            handles.push(tokio::spawn(async move {
                // Closing the semaphore is not part of this flow; acquire
                // only fails if it were, so surface that as a task error.
                let _permit = match permit_source.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return RecognitionResult {
                            object_id,
                            outcome: Err(Error::RecognitionTask {
                                object_id,
                                message: e.to_string(),
                            }),
                        }
                    }
                };
                let outcome = backend.recognize(&path, &task_mask, object_id).await;
                RecognitionResult { object_id, outcome }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = &result.outcome {
                        warn!(object_id = result.object_id, error = %e, "Recognition task failed");
                    }
                    results.push(result);
                }
                Err(join_err) => {
                    // A panicked task is a failed result, not a failed batch;
                    // the object id is unrecoverable from the handle alone.
                    warn!(error = %join_err, "Recognition task panicked");
                }
            }
        }
        results
    }
}
