//! User clicks: ordered ingestion, voxel resolution, per-object grouping
//! and the selection-cube geometry around each click.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use voxelseg_core::{Error, Result};

/// Reserved grouping key for background clicks.
pub const BACKGROUND_KEY: &str = "0";

/// One user click in 3D space.
///
/// Immutable once resolved; `voxel_idx` is set by the ledger and only ever
/// refreshed when clicks are re-resolved against a reloaded voxel set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Click {
    pub position: [f64; 3],
    #[serde(rename = "obj_idx")]
    pub object_id: u32,
    #[serde(rename = "obj_name")]
    pub object_name: String,
    pub time_idx: u64,
    #[serde(rename = "is_positive")]
    pub positive: bool,
    /// Nearest voxel index, resolved by the ledger.
    #[serde(rename = "id")]
    pub voxel_idx: Option<usize>,
    /// Half-width of the selection cube around the click.
    pub cube_size: f64,
}

impl Click {
    /// Points within the strict axis-aligned cube around this click.
    ///
    /// A point is inside only if all three axis distances are strictly less
    /// than `cube_size`; a point exactly at the boundary is excluded.
    pub fn cube_contains(&self, point: &[f64; 3]) -> bool {
        (point[0] - self.position[0]).abs() < self.cube_size
            && (point[1] - self.position[1]).abs() < self.cube_size
            && (point[2] - self.position[2]).abs() < self.cube_size
    }
}

/// Resolved per-object click data in the layout the model consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectClicks {
    pub voxel_indices: Vec<usize>,
    pub time_indices: Vec<u64>,
    pub positions: Vec<[f64; 3]>,
}

/// Insertion-ordered collection of clicks with derived per-object groupings.
///
/// The groupings are rebuilt wholesale from the click sequence by
/// [`ClickLedger::resolve_all`] and never edited independently.
#[derive(Debug, Clone, Default)]
pub struct ClickLedger {
    clicks: Vec<Click>,
    next_time_idx: u64,
    groups: BTreeMap<String, ObjectClicks>,
}

impl ClickLedger {
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(BACKGROUND_KEY.to_string(), ObjectClicks::default());
        Self {
            clicks: Vec::new(),
            next_time_idx: 0,
            groups,
        }
    }

    pub fn clicks(&self) -> &[Click] {
        &self.clicks
    }

    pub fn is_empty(&self) -> bool {
        self.clicks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clicks.len()
    }

    /// Resolved groupings keyed by object id (`"0"` = background).
    pub fn groups(&self) -> &BTreeMap<String, ObjectClicks> {
        &self.groups
    }

    /// Distinct nonzero object ids with at least one click, ascending.
    pub fn foreground_objects(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .clicks
            .iter()
            .map(|c| c.object_id)
            .filter(|&id| id != 0)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of objects with clicks, excluding background.
    pub fn object_count(&self) -> usize {
        self.foreground_objects().len()
    }

    /// Append a click with the next time index. The voxel index stays
    /// unresolved until [`resolve_all`](Self::resolve_all) runs.
    pub fn add_click(
        &mut self,
        position: [f64; 3],
        object_id: u32,
        object_name: impl Into<String>,
        positive: bool,
        cube_size: f64,
    ) -> &Click {
        let click = Click {
            position,
            object_id,
            object_name: object_name.into(),
            time_idx: self.next_time_idx,
            positive,
            voxel_idx: None,
            cube_size,
        };
        self.next_time_idx += 1;
        self.clicks.push(click);
        self.clicks.last().unwrap()
    }

    /// Append a click that carries its own time index (reload path).
    /// `next_time_idx` advances past it so time indices are never reused.
    pub fn add_click_raw(&mut self, click: Click) {
        self.next_time_idx = self.next_time_idx.max(click.time_idx + 1);
        self.clicks.push(click);
    }

    /// Resolve every click to its nearest voxel by Euclidean distance (ties
    /// to the lowest voxel index) and rebuild the per-object groupings from
    /// scratch. Idempotent against the same voxel positions.
    pub fn resolve_all(&mut self, voxel_positions: &[[f64; 3]]) -> Result<()> {
        if voxel_positions.is_empty() {
            return Err(Error::NoGeometry);
        }

        let mut groups = BTreeMap::new();
        groups.insert(BACKGROUND_KEY.to_string(), ObjectClicks::default());

        for click in &mut self.clicks {
            let nearest = nearest_voxel(&click.position, voxel_positions);
            click.voxel_idx = Some(nearest);

            let entry = groups
                .entry(click.object_id.to_string())
                .or_insert_with(ObjectClicks::default);
            entry.voxel_indices.push(nearest);
            entry.time_indices.push(click.time_idx);
            entry.positions.push(click.position);
        }

        self.groups = groups;
        debug!(
            clicks = self.clicks.len(),
            objects = self.object_count(),
            "Resolved clicks against voxel set"
        );
        Ok(())
    }

    /// Union of the selection cubes of every click belonging to `object_id`,
    /// evaluated over `positions`.
    pub fn cube_mask(&self, positions: &[[f64; 3]], object_id: u32) -> Vec<bool> {
        let mut mask = vec![false; positions.len()];
        for click in self.clicks.iter().filter(|c| c.object_id == object_id) {
            for (slot, point) in mask.iter_mut().zip(positions.iter()) {
                if !*slot && click.cube_contains(point) {
                    *slot = true;
                }
            }
        }
        mask
    }

    /// Ordered click log as JSON, the on-disk format of the click artifact.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.clicks)?)
    }

    /// Rebuild a ledger from a click log and resolve it against the current
    /// voxel positions, restoring the time counter past the highest index.
    pub fn from_json(json: &str, voxel_positions: &[[f64; 3]]) -> Result<Self> {
        let clicks: Vec<Click> = serde_json::from_str(json)?;
        let mut ledger = Self::new();
        for click in clicks {
            ledger.add_click_raw(click);
        }
        ledger.resolve_all(voxel_positions)?;
        Ok(ledger)
    }
}

fn nearest_voxel(position: &[f64; 3], voxel_positions: &[[f64; 3]]) -> usize {
    let mut best = 0usize;
    let mut best_dist = f64::INFINITY;
    for (idx, vp) in voxel_positions.iter().enumerate() {
        let d = (vp[0] - position[0]).powi(2)
            + (vp[1] - position[1]).powi(2)
            + (vp[2] - position[2]).powi(2);
        // Strict less-than keeps the lowest index on ties.
        if d < best_dist {
            best_dist = d;
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voxels() -> Vec<[f64; 3]> {
        vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
    }

    #[test]
    fn test_time_indices_are_monotonic() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.0; 3], 1, "chair", true, 0.02);
        ledger.add_click([1.0, 0.0, 0.0], 2, "desk", true, 0.02);
        ledger.add_click([0.0, 1.0, 0.0], 1, "chair", true, 0.02);
        let times: Vec<u64> = ledger.clicks().iter().map(|c| c.time_idx).collect();
        assert_eq!(times, vec![0, 1, 2]);
    }

    #[test]
    fn test_resolve_on_empty_voxels_fails() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.0; 3], 1, "chair", true, 0.02);
        assert!(matches!(ledger.resolve_all(&[]), Err(Error::NoGeometry)));
    }

    #[test]
    fn test_resolve_groups_by_object() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.1, 0.0, 0.0], 1, "chair", true, 0.02);
        ledger.add_click([0.9, 0.0, 0.0], 2, "desk", true, 0.02);
        ledger.add_click([0.0, 0.9, 0.0], 1, "chair", true, 0.02);
        ledger.resolve_all(&voxels()).unwrap();

        let groups = ledger.groups();
        assert!(groups.contains_key(BACKGROUND_KEY));
        assert_eq!(groups["1"].voxel_indices, vec![0, 2]);
        assert_eq!(groups["1"].time_indices, vec![0, 2]);
        assert_eq!(groups["2"].voxel_indices, vec![1]);
        assert_eq!(ledger.foreground_objects(), vec![1, 2]);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.1, 0.0, 0.0], 1, "chair", true, 0.02);
        ledger.add_click([0.2, 0.8, 0.0], 3, "lamp", true, 0.02);
        ledger.resolve_all(&voxels()).unwrap();
        let first = ledger.groups().clone();
        ledger.resolve_all(&voxels()).unwrap();
        assert_eq!(&first, ledger.groups());
    }

    #[test]
    fn test_nearest_tie_breaks_to_lowest_index() {
        // Equidistant between voxel 0 and voxel 1.
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.5, 0.0, 0.0], 1, "chair", true, 0.02);
        ledger.resolve_all(&voxels()).unwrap();
        assert_eq!(ledger.clicks()[0].voxel_idx, Some(0));
    }

    #[test]
    fn test_cube_mask_strict_boundary() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.0; 3], 1, "chair", true, 0.1);
        let points = vec![
            [0.05, 0.0, 0.0],  // inside
            [0.1, 0.0, 0.0],   // exactly at the half-width: excluded
            [0.0, 0.0, 0.099], // inside on all axes
            [0.09, 0.09, 0.2], // one axis out
        ];
        assert_eq!(
            ledger.cube_mask(&points, 1),
            vec![true, false, true, false]
        );
    }

    #[test]
    fn test_cube_mask_is_union_over_object_clicks() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.0; 3], 1, "chair", true, 0.1);
        ledger.add_click([1.0, 0.0, 0.0], 1, "chair", true, 0.1);
        ledger.add_click([0.0, 1.0, 0.0], 2, "desk", true, 0.1);
        let points = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert_eq!(ledger.cube_mask(&points, 1), vec![true, true, false]);
        assert_eq!(ledger.cube_mask(&points, 2), vec![false, false, true]);
    }

    #[test]
    fn test_json_round_trip_reproduces_groupings() {
        let mut ledger = ClickLedger::new();
        ledger.add_click([0.1, 0.0, 0.0], 1, "chair", true, 0.02);
        ledger.add_click([0.9, 0.1, 0.0], 2, "desk", true, 0.05);
        ledger.add_click([0.0, 0.95, 0.0], 1, "chair", false, 0.02);
        ledger.resolve_all(&voxels()).unwrap();

        let json = ledger.to_json().unwrap();
        let reloaded = ClickLedger::from_json(&json, &voxels()).unwrap();

        assert_eq!(ledger.groups(), reloaded.groups());
        assert_eq!(reloaded.next_time_idx, 3);
        assert!(!reloaded.clicks()[2].positive);
    }
}
