//! External collaborator seams: the segmentation model and the
//! vision-language recognition service.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;
use voxelseg_core::{Error, Result, SegmentationMask};

/// Inference request handed to the model: per-voxel features plus the
/// resolved click groups.
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub voxel_positions: Vec<[f64; 3]>,
    pub voxel_colors: Vec<[f32; 3]>,
    /// Resolved click voxel indices per foreground/background object id.
    pub click_voxels: BTreeMap<u32, Vec<usize>>,
    /// Click time indices per object id, aligned with `click_voxels`.
    pub click_times: BTreeMap<u32, Vec<u64>>,
}

/// Per-voxel class scores returned by the model.
///
/// One row per voxel and one column per known foreground object id in
/// `object_ids` order. The background column is implicit at score zero: a
/// voxel whose best foreground score is not positive labels as background.
#[derive(Debug, Clone)]
pub struct ClassScores {
    pub object_ids: Vec<u32>,
    pub scores: Array2<f32>,
}

impl ClassScores {
    /// Arg-max column per voxel, background when nothing beats zero.
    pub fn argmax_labels(&self) -> Vec<u32> {
        let mut labels = Vec::with_capacity(self.scores.nrows());
        for row in self.scores.rows() {
            let mut best = 0u32;
            let mut best_score = 0.0f32;
            for (col, &score) in row.iter().enumerate() {
                if score > best_score {
                    best_score = score;
                    best = self.object_ids[col];
                }
            }
            labels.push(best);
        }
        labels
    }
}

/// Opaque segmentation model: voxel features + click groups in, per-voxel
/// class scores out. Failures are not retried.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn predict(&self, request: ModelRequest) -> Result<ClassScores>;
}

/// Output of the recognition collaborator for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub selected_views: Vec<u32>,
    pub description: String,
    pub label: String,
    pub cost: f64,
}

/// Vision-language description service: renders views of one masked object
/// and describes it.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    async fn recognize(
        &self,
        geometry_path: &Path,
        mask: &SegmentationMask,
        object_id: u32,
    ) -> Result<RecognitionOutcome>;
}

/// HTTP-backed model gateway posting to a remote inference endpoint.
pub struct RemoteModelGateway {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct RemoteScores {
    object_ids: Vec<u32>,
    /// Row-major scores, one row per voxel.
    scores: Vec<Vec<f32>>,
}

impl RemoteModelGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ModelGateway(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ModelGateway for RemoteModelGateway {
    async fn predict(&self, request: ModelRequest) -> Result<ClassScores> {
        let voxels = request.voxel_positions.len();
        debug!(voxels, endpoint = %self.endpoint, "Calling model gateway");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::ModelGateway(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::ModelGateway(e.to_string()))?;

        let remote: RemoteScores = response
            .json()
            .await
            .map_err(|e| Error::ModelGateway(format!("invalid score payload: {}", e)))?;

        let cols = remote.object_ids.len();
        if remote.scores.len() != voxels {
            return Err(Error::ModelGateway(format!(
                "score rows {} do not match voxel count {}",
                remote.scores.len(),
                voxels
            )));
        }
        let mut flat = Vec::with_capacity(voxels * cols);
        for row in &remote.scores {
            if row.len() != cols {
                return Err(Error::ModelGateway(format!(
                    "score row width {} does not match {} object ids",
                    row.len(),
                    cols
                )));
            }
            flat.extend_from_slice(row);
        }
        let scores = Array2::from_shape_vec((voxels, cols), flat)
            .map_err(|e| Error::ModelGateway(e.to_string()))?;

        Ok(ClassScores {
            object_ids: remote.object_ids,
            scores,
        })
    }
}

/// HTTP-backed recognition service client.
pub struct RemoteRecognitionBackend {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct RecognitionRequest<'a> {
    geometry_path: &'a str,
    mask: &'a [u32],
    object_id: u32,
}

impl RemoteRecognitionBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RecognitionTask {
                object_id: 0,
                message: format!("failed to build client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl RecognitionBackend for RemoteRecognitionBackend {
    async fn recognize(
        &self,
        geometry_path: &Path,
        mask: &SegmentationMask,
        object_id: u32,
    ) -> Result<RecognitionOutcome> {
        let task_err = |message: String| Error::RecognitionTask { object_id, message };

        let request = RecognitionRequest {
            geometry_path: geometry_path.to_str().unwrap_or_default(),
            mask: &mask.0,
            object_id,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| task_err(e.to_string()))?
            .error_for_status()
            .map_err(|e| task_err(e.to_string()))?;

        response
            .json::<RecognitionOutcome>()
            .await
            .map_err(|e| task_err(format!("invalid recognition payload: {}", e)))
    }
}
