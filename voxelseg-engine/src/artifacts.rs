//! Artifact lifecycle: per-round result files, the packaged download bundle
//! and its delayed deletion.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voxelseg_core::{
    object_color, Error, ObjectInfo, Result, SegmentationMask, BACKGROUND_GRAY,
};

use crate::clicks::ClickLedger;
use crate::ply::{GeometryCodec, Scene};

/// Paths of one persisted inference round, all sharing a timestamp suffix.
#[derive(Debug, Clone)]
pub struct RoundArtifacts {
    pub mask_path: PathBuf,
    pub record_path: PathBuf,
    pub clicks_path: PathBuf,
    pub result_path: PathBuf,
    pub timestamp: String,
}

/// A packaged download read into memory as fixed-size chunks.
#[derive(Debug)]
pub struct ZipStream {
    pub chunks: Vec<Bytes>,
    pub total_len: u64,
}

/// Handle on a scheduled artifact deletion. Dropping the handle does not
/// cancel the timer; [`CleanupHandle::cancel`] does.
#[derive(Debug)]
pub struct CleanupHandle {
    task: JoinHandle<()>,
}

impl CleanupHandle {
    pub fn cancel(&self) {
        self.task.abort();
    }
}

/// Persists round outputs, packages downloads and governs their deletion.
pub struct ArtifactManager {
    codec: Arc<dyn GeometryCodec>,
    stream_chunk_size: usize,
}

impl ArtifactManager {
    pub fn new(codec: Arc<dyn GeometryCodec>, stream_chunk_size: usize) -> Self {
        Self {
            codec,
            stream_chunk_size,
        }
    }

    /// Write the raw mask, the human-readable record line, the ordered click
    /// log and the colorized geometry for one round. All four outputs share
    /// one timestamp; every write is verified before the next one starts.
    pub fn persist_round(
        &self,
        scene: &Scene,
        mask: &SegmentationMask,
        ledger: &ClickLedger,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<RoundArtifacts> {
        fs::create_dir_all(output_dir)?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

        let mask_path = output_dir.join(format!("{}_mask_{}.npy", prefix, timestamp));
        write_npy_i64(&mask_path, &mask.0)?;
        verify_written(&mask_path)?;
        info!(path = %mask_path.display(), "Saved mask");

        let record_path = output_dir.join(format!("{}_record.csv", prefix));
        let num_obj = ledger.object_count();
        let num_clicks = ledger.len();
        let avg_clicks = num_clicks as f64 / num_obj.max(1) as f64;
        let line = format!(
            "{}  {}  NumObjects:{}  AvgNumClicks:{:.1}  mIoU:NA\n",
            chrono::Local::now().format("%Y-%m-%d-%H-%M-%S"),
            prefix,
            num_obj,
            avg_clicks
        );
        let mut record = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&record_path)?;
        record.write_all(line.as_bytes())?;
        verify_written(&record_path)?;

        let clicks_path = output_dir.join(format!("{}_clicks_{}.json", prefix, timestamp));
        fs::write(&clicks_path, ledger.to_json()?)?;
        verify_written(&clicks_path)?;
        debug!(path = %clicks_path.display(), clicks = num_clicks, "Saved click log");

        let result_path = output_dir.join(format!(
            "{}_result_{}.{}",
            prefix,
            timestamp,
            self.codec.extension()
        ));
        let colors = colorize(mask, None);
        self.codec
            .write_scene(&result_path, &scene.geometry.coords, &colors, &scene.faces)?;
        verify_written(&result_path)?;
        info!(path = %result_path.display(), "Saved colorized geometry");

        Ok(RoundArtifacts {
            mask_path,
            record_path,
            clicks_path,
            result_path,
            timestamp,
        })
    }

    /// Build the download bundle: a colorized geometry file that keeps the
    /// scene's own background coloring, a metadata JSON, and one zip
    /// holding both.
    pub fn package_download(
        &self,
        scene: &Scene,
        mask: &SegmentationMask,
        object_info: Option<&BTreeMap<u32, ObjectInfo>>,
        ledger: &ClickLedger,
        original_name: &str,
        dest_zip: &Path,
    ) -> Result<PathBuf> {
        let staging = dest_zip
            .parent()
            .ok_or_else(|| artifact_err(dest_zip, "destination has no parent directory"))?;
        fs::create_dir_all(staging)?;

        let scene_name = format!("scene_with_colored_objects.{}", self.codec.extension());
        let scene_path = staging.join(&scene_name);
        let colors = colorize(mask, Some(&scene.geometry.colors));
        self.codec
            .write_scene(&scene_path, &scene.geometry.coords, &colors, &scene.faces)?;
        verify_written(&scene_path)?;

        let metadata_path = staging.join("metadata.json");
        let metadata = build_metadata(mask, object_info, ledger, &scene_name, original_name)?;
        fs::write(&metadata_path, metadata)?;
        verify_written(&metadata_path)?;

        let zip_file = File::create(dest_zip)?;
        let mut zip = zip::ZipWriter::new(zip_file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (path, arc_name) in [(&scene_path, scene_name.as_str()), (&metadata_path, "metadata.json")] {
            zip.start_file(arc_name, options)
                .map_err(|e| artifact_err(dest_zip, &e.to_string()))?;
            let contents = fs::read(path)?;
            zip.write_all(&contents)?;
        }
        zip.finish()
            .map_err(|e| artifact_err(dest_zip, &e.to_string()))?;
        verify_written(dest_zip)?;

        info!(path = %dest_zip.display(), "Packaged download bundle");
        Ok(dest_zip.to_path_buf())
    }

    /// Read the archive as fixed-size chunks and schedule deletion of its
    /// containing directory once `grace` elapses from now.
    ///
    /// The timer runs independently of streaming progress: a transfer slower
    /// than the grace period loses the file. Callers keep the returned
    /// handle and cancel it if the session resets before expiry.
    pub fn stream_and_expire(
        &self,
        zip_path: &Path,
        grace: Duration,
    ) -> Result<(ZipStream, CleanupHandle)> {
        let contents = fs::read(zip_path)?;
        let total_len = contents.len() as u64;
        let chunks = contents
            .chunks(self.stream_chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();

        let doomed = zip_path
            .parent()
            .ok_or_else(|| artifact_err(zip_path, "archive has no parent directory"))?
            .to_path_buf();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match fs::remove_dir_all(&doomed) {
                Ok(()) => debug!(path = %doomed.display(), "Expired download artifacts"),
                Err(e) => warn!(path = %doomed.display(), error = %e, "Failed to expire artifacts"),
            }
        });

        Ok((ZipStream { chunks, total_len }, CleanupHandle { task }))
    }
}

/// Full-resolution colors for an exported mask: objects get their
/// deterministic color; background keeps `base` colors when given, neutral
/// gray otherwise.
fn colorize(mask: &SegmentationMask, base: Option<&[[f32; 3]]>) -> Vec<[f32; 3]> {
    mask.0
        .iter()
        .enumerate()
        .map(|(idx, &id)| {
            if id == 0 {
                base.map(|b| b[idx]).unwrap_or(BACKGROUND_GRAY)
            } else {
                object_color(id)
            }
        })
        .collect()
}

fn build_metadata(
    mask: &SegmentationMask,
    object_info: Option<&BTreeMap<u32, ObjectInfo>>,
    ledger: &ClickLedger,
    scene_file: &str,
    original_name: &str,
) -> Result<String> {
    let mut objects = Vec::new();
    match object_info {
        Some(info) => {
            for (&id, entry) in info {
                objects.push(json!({
                    "id": id,
                    "label": entry.label,
                    "description": entry.description,
                    "color": object_color(id),
                    "cost": entry.cost,
                }));
            }
        }
        None => {
            for id in mask.distinct_objects() {
                objects.push(json!({
                    "id": id,
                    "label": format!("Object {}", id),
                    "color": object_color(id),
                }));
            }
        }
    }

    let mut object_counts = BTreeMap::new();
    for id in mask.distinct_objects() {
        object_counts.insert(id.to_string(), mask.point_count(id));
    }

    let metadata = json!({
        "objects": objects,
        "object_counts": object_counts,
        "click_data": ledger.clicks(),
        "file_info": {
            "ply_file": scene_file,
            "original_file": original_name,
        },
    });
    Ok(serde_json::to_string_pretty(&metadata)?)
}

/// Minimal NPY v1.0 writer for a one-dimensional little-endian i64 array.
fn write_npy_i64(path: &Path, values: &[u32]) -> Result<()> {
    let mut header = format!(
        "{{'descr': '<i8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // Magic (6) + version (2) + header-len field (2) + header, padded so the
    // data section starts 64-byte aligned, newline terminated.
    let unpadded = 10 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut file = File::create(path)?;
    file.write_all(b"\x93NUMPY\x01\x00")?;
    file.write_all(&(header.len() as u16).to_le_bytes())?;
    file.write_all(header.as_bytes())?;
    for &v in values {
        file.write_all(&(v as i64).to_le_bytes())?;
    }
    Ok(())
}

fn verify_written(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => {
            error!(path = %path.display(), "Artifact missing after write");
            Err(artifact_err(path, "file missing after write"))
        }
    }
}

fn artifact_err(path: &Path, message: &str) -> Error {
    Error::ArtifactBuild {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}
