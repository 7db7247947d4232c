//! Process-wide session state: the single active session, its lifecycle and
//! the mutual-exclusion discipline around every read-then-write operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use voxelseg_core::{EngineConfig, Error, ObjectInfo, Result, SegmentationMask};

use crate::artifacts::{ArtifactManager, CleanupHandle, RoundArtifacts, ZipStream};
use crate::clicks::ClickLedger;
use crate::gateway::{ModelGateway, RecognitionBackend};
use crate::orchestrator::InferenceOrchestrator;
use crate::ply::{GeometryCodec, Scene};
use crate::recognition::RecognitionDispatcher;
use crate::voxel::{VoxelMap, VoxelMapper};

/// Caller-supplied click, not yet owned by the ledger.
#[derive(Debug, Clone)]
pub struct ClickSpec {
    pub position: [f64; 3],
    pub object_id: u32,
    pub object_name: String,
    /// Explicit time index when the caller owns click ordering (the HTTP
    /// client replays its full click history); `None` lets the ledger
    /// assign the next index.
    pub time_idx: Option<u64>,
    pub positive: bool,
    pub cube_size: f64,
}

/// Observable lifecycle state of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Loaded,
    HasClicks,
    HasMask,
    HasRecognition,
}

/// Metadata returned to the uploader.
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub filename: String,
    pub point_count: usize,
    pub bbox_min: [f64; 3],
    pub bbox_max: [f64; 3],
}

/// Recognition outcome per object id; failures stay scoped to their id.
#[derive(Debug, Clone)]
pub struct RecognitionReport {
    pub object_id: u32,
    pub info: Option<ObjectInfo>,
    pub error: Option<String>,
}

struct Session {
    scene: Scene,
    source_path: PathBuf,
    source_name: String,
    /// Scratch directory owning the uploaded file for the session lifetime.
    _scratch: tempfile::TempDir,
    voxel_map: VoxelMap,
    ledger: ClickLedger,
    mask: Option<SegmentationMask>,
    artifacts: Option<RoundArtifacts>,
    object_info: Option<BTreeMap<u32, ObjectInfo>>,
    cleanup: Option<CleanupHandle>,
}

impl Session {
    fn state(&self) -> SessionState {
        // Recognition only counts once a round has produced a mask; object
        // info upserted ahead of any round does not advance the lifecycle.
        if self.mask.is_some() {
            if self.object_info.is_some() {
                SessionState::HasRecognition
            } else {
                SessionState::HasMask
            }
        } else if !self.ledger.is_empty() {
            SessionState::HasClicks
        } else {
            SessionState::Loaded
        }
    }
}

/// Holder of the single active session.
///
/// Every operation that reads then writes session fields takes the one
/// session lock for its whole duration, so concurrent uploads, click
/// batches and inference rounds serialize instead of racing.
pub struct SessionStore {
    config: EngineConfig,
    codec: Arc<dyn GeometryCodec>,
    artifacts: ArtifactManager,
    gateway: Arc<dyn ModelGateway>,
    dispatcher: RecognitionDispatcher,
    session: Mutex<Option<Session>>,
}

impl SessionStore {
    pub fn new(
        config: EngineConfig,
        codec: Arc<dyn GeometryCodec>,
        gateway: Arc<dyn ModelGateway>,
        recognizer: Arc<dyn RecognitionBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let artifacts = ArtifactManager::new(codec.clone(), config.stream_chunk_size);
        let dispatcher = RecognitionDispatcher::new(recognizer, config.max_recognition_workers);
        Ok(Self {
            config,
            codec,
            artifacts,
            gateway,
            dispatcher,
            session: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> SessionState {
        match self.session.lock().await.as_ref() {
            Some(session) => session.state(),
            None => SessionState::Empty,
        }
    }

    /// Load a new geometry, unconditionally resetting the session.
    ///
    /// Parsing and voxelization run on a blocking worker so the request
    /// pool stays free. Any pending artifact cleanup of the previous
    /// session is cancelled before the session is replaced.
    pub async fn load_geometry(&self, filename: &str, contents: Vec<u8>) -> Result<UploadSummary> {
        let scratch = tempfile::Builder::new().prefix("voxelseg_session_").tempdir()?;
        let safe_name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.ply")
            .to_string();
        let source_path = scratch.path().join(&safe_name);
        std::fs::write(&source_path, &contents)?;

        let codec = self.codec.clone();
        let parse_path = source_path.clone();
        let voxel_size = self.config.voxel_size;
        let (scene, voxel_map) = tokio::task::spawn_blocking(move || {
            let scene = codec.read_scene(&parse_path)?;
            let map = VoxelMapper::new(voxel_size)
                .build(&scene.geometry.coords, &scene.geometry.colors)?;
            Ok::<_, Error>((scene, map))
        })
        .await
        .map_err(blocking_failure)??;

        let (bbox_min, bbox_max) = scene.geometry.bounding_box();
        let summary = UploadSummary {
            filename: safe_name.clone(),
            point_count: scene.geometry.len(),
            bbox_min,
            bbox_max,
        };

        let mut guard = self.session.lock().await;
        if let Some(old) = guard.take() {
            if let Some(cleanup) = &old.cleanup {
                cleanup.cancel();
            }
            info!(previous = %old.source_name, "Discarding previous session");
        }
        *guard = Some(Session {
            scene,
            source_path,
            source_name: safe_name,
            _scratch: scratch,
            voxel_map,
            ledger: ClickLedger::new(),
            mask: None,
            artifacts: None,
            object_info: None,
            cleanup: None,
        });

        info!(
            filename = %summary.filename,
            points = summary.point_count,
            "Session loaded"
        );
        Ok(summary)
    }

    /// Append clicks to the active session's ledger.
    pub async fn add_clicks(&self, specs: Vec<ClickSpec>) -> Result<usize> {
        let mut guard = self.session.lock().await;
        let session = require_session(&mut guard)?;
        append_specs(&mut session.ledger, specs);
        Ok(session.ledger.len())
    }

    /// Run one inference round and persist its artifacts.
    ///
    /// When `clicks` is given it is the caller's authoritative click history
    /// and replaces the ledger wholesale (the transport client replays every
    /// click each round); `None` reuses the accumulated ledger.
    pub async fn run_inference(
        &self,
        clicks: Option<Vec<ClickSpec>>,
    ) -> Result<SegmentationMask> {
        let mut guard = self.session.lock().await;
        let session = require_session(&mut guard)?;

        if let Some(specs) = clicks {
            let mut ledger = ClickLedger::new();
            append_specs(&mut ledger, specs);
            session.ledger = ledger;
        }

        let mask = InferenceOrchestrator::run_round(
            &session.voxel_map,
            &mut session.ledger,
            self.gateway.as_ref(),
        )
        .await?;

        let stem = session
            .source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scene");
        let prefix = format!("web_session_{}", stem);
        let artifacts = self.artifacts.persist_round(
            &session.scene,
            &mask,
            &session.ledger,
            &self.config.output_dir,
            &prefix,
        )?;

        session.mask = Some(mask.clone());
        session.artifacts = Some(artifacts);
        Ok(mask)
    }

    /// Run recognition for every nonzero object id in `mask` and fold the
    /// successful descriptions into the session's object info.
    pub async fn recognize_objects(&self, mask: Vec<u32>) -> Result<Vec<RecognitionReport>> {
        if mask.is_empty() {
            return Err(Error::Precondition("mask is empty".into()));
        }
        let mask = SegmentationMask(mask);
        if mask.distinct_objects().is_empty() {
            return Err(Error::Precondition(
                "no objects found in the mask (all values are background)".into(),
            ));
        }

        let mut guard = self.session.lock().await;
        let session = require_session(&mut guard)?;
        let geometry_path = session.source_path.clone();

        let results = self.dispatcher.dispatch(&mask, &geometry_path).await;

        let mut info_map = session.object_info.take().unwrap_or_default();
        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result.outcome {
                Ok(outcome) => {
                    let info = ObjectInfo {
                        label: outcome.label,
                        description: outcome.description,
                        selected_views: outcome.selected_views,
                        cost: outcome.cost,
                        point_count: mask.point_count(result.object_id),
                    };
                    info_map.insert(result.object_id, info.clone());
                    reports.push(RecognitionReport {
                        object_id: result.object_id,
                        info: Some(info),
                        error: None,
                    });
                }
                Err(e) => reports.push(RecognitionReport {
                    object_id: result.object_id,
                    info: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        session.object_info = Some(info_map);
        Ok(reports)
    }

    /// Upsert label/description for one object id, creating a minimal entry
    /// for ids no recognizer has seen.
    pub async fn update_object_info(
        &self,
        object_id: u32,
        label: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        let mut guard = self.session.lock().await;
        let session = require_session(&mut guard)?;

        let info_map = session.object_info.get_or_insert_with(BTreeMap::new);
        let entry = info_map
            .entry(object_id)
            .or_insert_with(|| ObjectInfo::placeholder(object_id));
        if let Some(label) = label {
            entry.label = label;
        }
        if let Some(description) = description {
            entry.description = description;
        }
        Ok(())
    }

    /// Package the latest round into a zip and hand it back as chunks.
    ///
    /// The bundle lives in a detached staging directory whose deletion is
    /// scheduled `artifact_grace_secs` from now; the previous pending
    /// cleanup, if any, is superseded.
    pub async fn package_and_stream_download(&self) -> Result<(ZipStream, String)> {
        let mut guard = self.session.lock().await;
        let session = require_session(&mut guard)?;
        let mask = session
            .mask
            .clone()
            .ok_or_else(|| Error::Precondition("no results available; run inference first".into()))?;

        std::fs::create_dir_all(&self.config.output_dir)?;
        let staging = tempfile::Builder::new()
            .prefix("voxelseg_download_")
            .tempdir_in(&self.config.output_dir)?
            .keep();
        let zip_path = staging.join("segmentation_results.zip");

        self.artifacts.package_download(
            &session.scene,
            &mask,
            session.object_info.as_ref(),
            &session.ledger,
            &session.source_name,
            &zip_path,
        )?;

        let grace = Duration::from_secs(self.config.artifact_grace_secs);
        let (stream, cleanup) = self.artifacts.stream_and_expire(&zip_path, grace)?;
        if let Some(previous) = session.cleanup.replace(cleanup) {
            // The superseded timer would delete a directory nobody streams
            // from anymore; let it run its course.
            drop(previous);
        }

        Ok((stream, "segmentation_results.zip".to_string()))
    }

    /// Paths of the most recently persisted round, if any.
    pub async fn latest_artifacts(&self) -> Option<RoundArtifacts> {
        let guard = self.session.lock().await;
        guard.as_ref().and_then(|session| session.artifacts.clone())
    }
}

fn append_specs(ledger: &mut ClickLedger, specs: Vec<ClickSpec>) {
    for spec in specs {
        match spec.time_idx {
            Some(time_idx) => ledger.add_click_raw(crate::clicks::Click {
                position: spec.position,
                object_id: spec.object_id,
                object_name: spec.object_name,
                time_idx,
                positive: spec.positive,
                voxel_idx: None,
                cube_size: spec.cube_size,
            }),
            None => {
                ledger.add_click(
                    spec.position,
                    spec.object_id,
                    spec.object_name,
                    spec.positive,
                    spec.cube_size,
                );
            }
        }
    }
}

fn require_session<'a>(guard: &'a mut Option<Session>) -> Result<&'a mut Session> {
    guard.as_mut().ok_or_else(|| {
        warn!("Operation attempted without a loaded session");
        Error::Precondition("no geometry loaded; upload a scene first".into())
    })
}

fn blocking_failure(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
