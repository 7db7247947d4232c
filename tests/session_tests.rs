// End-to-end session lifecycle tests against stubbed collaborator services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array2;
use voxelseg_core::{EngineConfig, Result, SegmentationMask};
use voxelseg_engine::gateway::{
    ClassScores, ModelGateway, ModelRequest, RecognitionBackend, RecognitionOutcome,
};
use voxelseg_engine::ply::AsciiPlyCodec;
use voxelseg_engine::session::{ClickSpec, SessionState, SessionStore};

/// Model stub that scores every voxel as background, so whatever foreground
/// appears in the mask got there through click precedence alone.
struct BackgroundGateway;

#[async_trait]
impl ModelGateway for BackgroundGateway {
    async fn predict(&self, request: ModelRequest) -> Result<ClassScores> {
        let ids: Vec<u32> = request
            .click_voxels
            .keys()
            .copied()
            .filter(|&id| id != 0)
            .collect();
        Ok(ClassScores {
            scores: Array2::zeros((request.voxel_positions.len(), ids.len())),
            object_ids: ids,
        })
    }
}

struct EchoRecognizer;

#[async_trait]
impl RecognitionBackend for EchoRecognizer {
    async fn recognize(
        &self,
        _geometry_path: &Path,
        _mask: &SegmentationMask,
        object_id: u32,
    ) -> Result<RecognitionOutcome> {
        Ok(RecognitionOutcome {
            selected_views: vec![0, 2],
            description: format!("a described object {}", object_id),
            label: format!("label_{}", object_id),
            cost: 0.003,
        })
    }
}

const FOUR_POINTS: &str = "ply\nformat ascii 1.0\nelement vertex 4\n\
property double x\nproperty double y\nproperty double z\n\
end_header\n0 0 0\n1 0 0\n0 1 0\n1 1 1\n";

fn store_with_outputs() -> (SessionStore, PathBuf) {
    let outputs = tempfile::tempdir().unwrap().keep();
    let config = EngineConfig {
        output_dir: outputs.clone(),
        artifact_grace_secs: 1,
        ..EngineConfig::default()
    };
    let store = SessionStore::new(
        config,
        Arc::new(AsciiPlyCodec),
        Arc::new(BackgroundGateway),
        Arc::new(EchoRecognizer),
    )
    .unwrap();
    (store, outputs)
}

fn click(position: [f64; 3], object_id: u32, time_idx: u64) -> ClickSpec {
    ClickSpec {
        position,
        object_id,
        object_name: format!("object_{}", object_id),
        time_idx: Some(time_idx),
        positive: true,
        cube_size: 0.1,
    }
}

#[tokio::test]
async fn test_four_point_scenario_end_to_end() {
    let (store, _outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();

    let mask = store
        .run_inference(Some(vec![click([0.0, 0.0, 0.0], 1, 0)]))
        .await
        .unwrap();
    assert_eq!(mask.0, vec![1, 0, 0, 0]);
}

#[tokio::test]
async fn test_round_artifacts_written_per_round() {
    let (store, outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    store
        .run_inference(Some(vec![click([0.0, 0.0, 0.0], 1, 0)]))
        .await
        .unwrap();

    let artifacts = store.latest_artifacts().await.unwrap();
    assert!(artifacts.mask_path.exists());
    assert!(artifacts.result_path.exists());

    let names: Vec<String> = std::fs::read_dir(&outputs)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.starts_with("web_session_scan_mask_") && n.ends_with(".npy")));
    assert!(names.iter().any(|n| n == "web_session_scan_record.csv"));
    assert!(names.iter().any(|n| n.starts_with("web_session_scan_clicks_") && n.ends_with(".json")));
    assert!(names.iter().any(|n| n.starts_with("web_session_scan_result_") && n.ends_with(".ply")));

    // A second round appends to the record rather than replacing it.
    store
        .run_inference(Some(vec![
            click([0.0, 0.0, 0.0], 1, 0),
            click([1.0, 0.0, 0.0], 2, 1),
        ]))
        .await
        .unwrap();
    let record = std::fs::read_to_string(outputs.join("web_session_scan_record.csv")).unwrap();
    assert_eq!(record.lines().count(), 2);
    assert!(record.lines().nth(1).unwrap().contains("NumObjects:2"));
}

#[tokio::test]
async fn test_recognition_covers_every_foreground_object() {
    let (store, _outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();

    let reports = store
        .recognize_objects(vec![1, 2, 2, 0])
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        let info = report.info.as_ref().unwrap();
        assert_eq!(info.label, format!("label_{}", report.object_id));
        assert!(info.cost > 0.0);
    }
    let two = reports.iter().find(|r| r.object_id == 2).unwrap();
    assert_eq!(two.info.as_ref().unwrap().point_count, 2);
}

#[tokio::test]
async fn test_clicks_accumulate_without_replacement() {
    let (store, _outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();

    store.add_clicks(vec![click([0.0, 0.0, 0.0], 1, 0)]).await.unwrap();
    let count = store.add_clicks(vec![click([1.0, 0.0, 0.0], 2, 1)]).await.unwrap();
    assert_eq!(count, 2);

    let mask = store.run_inference(None).await.unwrap();
    assert_eq!(mask.0, vec![1, 2, 0, 0]);
}

#[tokio::test]
async fn test_new_upload_resets_clicks_and_mask() {
    let (store, _outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    store
        .run_inference(Some(vec![click([0.0, 0.0, 0.0], 1, 0)]))
        .await
        .unwrap();
    assert_eq!(store.state().await, SessionState::HasMask);

    store
        .load_geometry("fresh.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    assert_eq!(store.state().await, SessionState::Loaded);

    // Inference on the fresh session needs clicks again.
    assert!(store.run_inference(None).await.is_err());
}

#[tokio::test]
async fn test_download_bundle_is_a_zip_with_declared_length() {
    let (store, _outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    store
        .run_inference(Some(vec![click([0.0, 0.0, 0.0], 1, 0)]))
        .await
        .unwrap();
    store.recognize_objects(vec![1, 0, 0, 0]).await.unwrap();

    let (stream, filename) = store.package_and_stream_download().await.unwrap();
    assert_eq!(filename, "segmentation_results.zip");
    let total: usize = stream.chunks.iter().map(|c| c.len()).sum();
    assert_eq!(total as u64, stream.total_len);
    assert_eq!(&stream.chunks[0][..4], b"PK\x03\x04");
}

#[tokio::test]
async fn test_reset_cancels_pending_bundle_expiry() {
    // Grace period is 1 second in this store.
    let (store, outputs) = store_with_outputs();
    store
        .load_geometry("scan.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    store
        .run_inference(Some(vec![click([0.0, 0.0, 0.0], 1, 0)]))
        .await
        .unwrap();
    store.package_and_stream_download().await.unwrap();

    let staging = std::fs::read_dir(&outputs)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| {
            p.is_dir()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("voxelseg_download_"))
                    .unwrap_or(false)
        })
        .expect("staged bundle directory");
    assert!(staging.join("segmentation_results.zip").is_file());

    // A fresh upload supersedes the session and cancels the deletion timer,
    // so the bundle outlives the grace period.
    store
        .load_geometry("fresh.ply", FOUR_POINTS.as_bytes().to_vec())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert!(staging.join("segmentation_results.zip").is_file());
}

#[tokio::test]
async fn test_unsupported_geometry_is_rejected() {
    let (store, _outputs) = store_with_outputs();
    let err = store
        .load_geometry("cube.obj", b"o cube\nv 0 0 0\n".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "GEOMETRY_FORMAT");
    assert_eq!(store.state().await, SessionState::Empty);
}
