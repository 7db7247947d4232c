// HTTP server with API routes for the segmentation session

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use voxelseg_core::Error;
use voxelseg_engine::session::{ClickSpec, SessionStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<SessionStore>,
}

// Response types
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    #[serde(rename = "pointCount")]
    pub point_count: usize,
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Deserialize)]
pub struct InferRequest {
    #[serde(rename = "clickData")]
    pub click_data: ClickData,
    #[serde(rename = "cubeSize")]
    pub cube_size: f64,
    #[serde(rename = "objectNames", default)]
    pub object_names: Vec<String>,
}

/// Click state replayed by the client each round, keyed by object id.
/// `clickIdx` carries the client's own nearest-point indices; the engine
/// re-resolves positions against its voxel set, so only the positions and
/// time indices are consumed here.
#[derive(Debug, Deserialize)]
pub struct ClickData {
    #[serde(rename = "clickIdx", default)]
    pub click_idx: BTreeMap<String, Vec<i64>>,
    #[serde(rename = "clickTimeIdx")]
    pub click_time_idx: BTreeMap<String, Vec<u64>>,
    #[serde(rename = "clickPositions")]
    pub click_positions: BTreeMap<String, Vec<[f64; 3]>>,
}

#[derive(Debug, Serialize)]
pub struct InferResponse {
    #[serde(rename = "segmentedPointCloud")]
    pub segmented_point_cloud: SegmentedPointCloud,
}

#[derive(Debug, Serialize)]
pub struct SegmentedPointCloud {
    pub segmentation: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MaskRecognitionRequest {
    pub mask: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct RecognitionEntry {
    pub selected_views: Vec<u32>,
    pub description: String,
    pub label: String,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecognitionResponse {
    pub result: Vec<RecognitionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectUpdate {
    pub id: u32,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateObjectsRequest {
    pub objects: Vec<ObjectUpdate>,
}

#[derive(Debug, Serialize)]
pub struct UpdateObjectsResponse {
    pub updated_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn translate_error(e: Error) -> ApiError {
    let status = if e.is_user_error() {
        warn!(code = e.code(), error = %e, "Request rejected");
        StatusCode::BAD_REQUEST
    } else {
        error!(code = e.code(), error = %e, "Request failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let response = Json(ErrorResponse {
        error: e.to_string(),
        code: e.code().to_string(),
    });
    (status, response)
}

fn bad_request(message: impl Into<String>) -> ApiError {
    translate_error(Error::Precondition(message.into()))
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/infer", post(infer_handler))
        .route("/mask_obj_recognition", post(mask_obj_recognition_handler))
        .route("/update-objects", post(update_objects_handler))
        .route("/download-results", get(download_results_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn upload_handler(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart payload: {}", e)))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let contents = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;

        info!(filename = %filename, bytes = contents.len(), "Receiving upload");
        let summary = state
            .store
            .load_geometry(&filename, contents.to_vec())
            .await
            .map_err(translate_error)?;

        return Ok(Json(UploadResponse {
            filename: summary.filename,
            point_count: summary.point_count,
            bounding_box: BoundingBox {
                min: summary.bbox_min,
                max: summary.bbox_max,
            },
        }));
    }
    Err(bad_request("multipart payload contains no file"))
}

async fn infer_handler(
    State(state): State<ApiState>,
    Json(request): Json<InferRequest>,
) -> Result<Json<InferResponse>, ApiError> {
    let specs = click_specs_from_request(&request)?;
    let mask = state
        .store
        .run_inference(Some(specs))
        .await
        .map_err(translate_error)?;

    Ok(Json(InferResponse {
        segmented_point_cloud: SegmentedPointCloud { segmentation: mask.0 },
    }))
}

fn click_specs_from_request(request: &InferRequest) -> Result<Vec<ClickSpec>, ApiError> {
    let mut specs = Vec::new();
    for (key, positions) in &request.click_data.click_positions {
        let object_id: u32 = key
            .parse()
            .map_err(|_| bad_request(format!("invalid object id {:?} in clickPositions", key)))?;
        let times = request
            .click_data
            .click_time_idx
            .get(key)
            .ok_or_else(|| bad_request(format!("missing clickTimeIdx entry for object {}", key)))?;
        if times.len() != positions.len() {
            return Err(bad_request(format!(
                "object {}: {} positions but {} time indices",
                key,
                positions.len(),
                times.len()
            )));
        }

        let object_name = if object_id == 0 {
            "background".to_string()
        } else {
            request
                .object_names
                .get((object_id - 1) as usize)
                .cloned()
                .unwrap_or_else(|| format!("object_{}", object_id))
        };

        for (position, &time_idx) in positions.iter().zip(times) {
            specs.push(ClickSpec {
                position: *position,
                object_id,
                object_name: object_name.clone(),
                time_idx: Some(time_idx),
                positive: true,
                cube_size: request.cube_size,
            });
        }
    }
    Ok(specs)
}

async fn mask_obj_recognition_handler(
    State(state): State<ApiState>,
    Json(request): Json<MaskRecognitionRequest>,
) -> Result<Json<RecognitionResponse>, ApiError> {
    let reports = state
        .store
        .recognize_objects(request.mask)
        .await
        .map_err(translate_error)?;

    let result = reports
        .into_iter()
        .map(|report| match report.info {
            Some(info) => RecognitionEntry {
                selected_views: info.selected_views,
                description: info.description,
                label: info.label,
                cost: info.cost,
                error: None,
            },
            None => RecognitionEntry {
                selected_views: Vec::new(),
                description: String::new(),
                label: format!("object_{}", report.object_id),
                cost: 0.0,
                error: report.error,
            },
        })
        .collect();

    Ok(Json(RecognitionResponse { result }))
}

async fn update_objects_handler(
    State(state): State<ApiState>,
    Json(request): Json<UpdateObjectsRequest>,
) -> Result<Json<UpdateObjectsResponse>, ApiError> {
    let mut updated_count = 0;
    for update in request.objects {
        state
            .store
            .update_object_info(update.id, update.name, update.description)
            .await
            .map_err(translate_error)?;
        updated_count += 1;
    }
    Ok(Json(UpdateObjectsResponse { updated_count }))
}

async fn download_results_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let (stream, filename) = state
        .store
        .package_and_stream_download()
        .await
        .map_err(translate_error)?;

    let total_len = stream.total_len;
    let body = Body::from_stream(futures::stream::iter(
        stream.chunks.into_iter().map(Ok::<_, Infallible>),
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .header(header::CONTENT_LENGTH, total_len)
        .body(body)
        .map_err(|e| {
            error!(error = %e, "Failed to build download response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to build download response".to_string(),
                    code: "DOWNLOAD".to_string(),
                }),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer_request(positions: Vec<(&str, Vec<[f64; 3]>, Vec<u64>)>) -> InferRequest {
        let mut click_positions = BTreeMap::new();
        let mut click_time_idx = BTreeMap::new();
        for (key, pos, times) in positions {
            click_positions.insert(key.to_string(), pos);
            click_time_idx.insert(key.to_string(), times);
        }
        InferRequest {
            click_data: ClickData {
                click_idx: BTreeMap::new(),
                click_time_idx,
                click_positions,
            },
            cube_size: 0.1,
            object_names: vec!["chair".to_string()],
        }
    }

    #[test]
    fn test_click_specs_use_object_names_positionally() {
        let request = infer_request(vec![
            ("1", vec![[0.0, 0.0, 0.0]], vec![0]),
            ("2", vec![[1.0, 0.0, 0.0]], vec![1]),
            ("0", vec![[2.0, 0.0, 0.0]], vec![2]),
        ]);
        let specs = click_specs_from_request(&request).unwrap();
        assert_eq!(specs.len(), 3);

        let by_id = |id: u32| specs.iter().find(|s| s.object_id == id).unwrap();
        assert_eq!(by_id(0).object_name, "background");
        assert_eq!(by_id(1).object_name, "chair");
        // No name at index 1: fallback naming.
        assert_eq!(by_id(2).object_name, "object_2");
        assert_eq!(by_id(1).time_idx, Some(0));
    }

    #[test]
    fn test_click_specs_reject_mismatched_times() {
        let request = infer_request(vec![("1", vec![[0.0; 3], [1.0, 0.0, 0.0]], vec![0])]);
        let (status, _) = click_specs_from_request(&request).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_click_specs_reject_non_numeric_object_key() {
        let request = infer_request(vec![("chair", vec![[0.0; 3]], vec![0])]);
        assert!(click_specs_from_request(&request).is_err());
    }

    #[test]
    fn test_error_translation_status_codes() {
        let (status, _) = translate_error(Error::Precondition("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = translate_error(Error::ModelGateway("down".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (status, body) = translate_error(Error::NoGeometry);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "NO_GEOMETRY");
    }
}
