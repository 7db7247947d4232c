//! Drives one segmentation round: resolve clicks, invoke the model, apply
//! click-precedence rules, project back to full resolution.

use tracing::{debug, info};
use voxelseg_core::{Error, Result, SegmentationMask};

use crate::clicks::ClickLedger;
use crate::gateway::{ModelGateway, ModelRequest};
use crate::voxel::VoxelMap;

pub struct InferenceOrchestrator;

impl InferenceOrchestrator {
    /// Run one inference round against the loaded voxel map.
    ///
    /// Clicks are ground truth: after the model's arg-max labeling, every
    /// foreground click forces its resolved voxel to its own object id, and
    /// each object's selection-cube union forces the surrounding voxels the
    /// same way. The voxel labels are then broadcast to full resolution.
    pub async fn run_round(
        voxel_map: &VoxelMap,
        ledger: &mut ClickLedger,
        gateway: &dyn ModelGateway,
    ) -> Result<SegmentationMask> {
        if ledger.is_empty() {
            return Err(Error::Precondition(
                "no clicks available; add clicks before running inference".into(),
            ));
        }

        ledger.resolve_all(voxel_map.positions())?;

        let mut click_voxels = std::collections::BTreeMap::new();
        let mut click_times = std::collections::BTreeMap::new();
        for (key, group) in ledger.groups() {
            let object_id: u32 = key
                .parse()
                .map_err(|_| Error::Precondition(format!("invalid object key {:?}", key)))?;
            click_voxels.insert(object_id, group.voxel_indices.clone());
            click_times.insert(object_id, group.time_indices.clone());
        }

        let request = ModelRequest {
            voxel_positions: voxel_map.positions().to_vec(),
            voxel_colors: voxel_map.colors().to_vec(),
            click_voxels,
            click_times,
        };
        let scores = gateway.predict(request).await?;
        if scores.scores.nrows() != voxel_map.voxel_count() {
            return Err(Error::ModelGateway(format!(
                "model returned {} score rows for {} voxels",
                scores.scores.nrows(),
                voxel_map.voxel_count()
            )));
        }

        let mut labels = scores.argmax_labels();

        // Click precedence: the model never relabels a clicked voxel.
        for click in ledger.clicks() {
            if click.object_id != 0 {
                if let Some(voxel) = click.voxel_idx {
                    labels[voxel] = click.object_id;
                }
            }
        }

        // Cube override: spatial intent near a click dominates the model
        // beyond the single nearest voxel.
        for object_id in ledger.foreground_objects() {
            let cube = ledger.cube_mask(voxel_map.positions(), object_id);
            for (label, inside) in labels.iter_mut().zip(cube) {
                if inside {
                    *label = object_id;
                }
            }
        }

        let full = voxel_map.broadcast(&labels);
        let mask = SegmentationMask(full);

        info!(
            objects = mask.distinct_objects().len(),
            clicks = ledger.len(),
            points = mask.len(),
            "Inference round complete"
        );
        debug!(voxels = voxel_map.voxel_count(), "Labels broadcast to full resolution");
        Ok(mask)
    }
}
