//! Shared data model for the segmentation session engine

use serde::{Deserialize, Serialize};

/// Full-resolution scene geometry: an ordered sequence of points or mesh
/// vertices with positions and RGB colors in `[0, 1]`.
///
/// Immutable once loaded; a new upload replaces it wholesale.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub coords: Vec<[f64; 3]>,
    pub colors: Vec<[f32; 3]>,
    /// True for mesh vertices (topology owned by the codec), false for raw
    /// point clouds.
    pub is_surface: bool,
}

impl Geometry {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Axis-aligned bounding box as `(min, max)`.
    pub fn bounding_box(&self) -> ([f64; 3], [f64; 3]) {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for p in &self.coords {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        (min, max)
    }
}

/// Per-point object assignment: one id per full-resolution point,
/// 0 = background. Produced once per inference round and never mutated;
/// the next round replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationMask(pub Vec<u32>);

impl SegmentationMask {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Distinct nonzero object ids in ascending order.
    pub fn distinct_objects(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.0.iter().copied().filter(|&id| id != 0).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Number of points labeled with `object_id`.
    pub fn point_count(&self, object_id: u32) -> usize {
        self.0.iter().filter(|&&id| id == object_id).count()
    }
}

/// Post-hoc recognition output for one object id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub label: String,
    pub description: String,
    pub selected_views: Vec<u32>,
    /// Monetary cost of producing the description, in USD.
    pub cost: f64,
    pub point_count: usize,
}

impl ObjectInfo {
    /// Minimal entry for an object id no recognizer has described yet.
    pub fn placeholder(object_id: u32) -> Self {
        Self {
            label: format!("Object {}", object_id),
            description: String::new(),
            selected_views: Vec::new(),
            cost: 0.0,
            point_count: 0,
        }
    }
}

/// Deterministic display color for an object id.
///
/// Hue walks the wheel in 50-degree steps with full saturation at 50%
/// lightness; the conversion matches THREE.Color::setHSL so exported
/// geometry agrees with the viewer.
pub fn object_color(object_id: u32) -> [f32; 3] {
    let hue = ((object_id as u64 * 50) % 360) as f64 / 360.0;
    let (s, l) = (1.0_f64, 0.5_f64);

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    fn hue_to_rgb(p: f64, q: f64, mut t: f64) -> f64 {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 1.0 / 2.0 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    }

    [
        hue_to_rgb(p, q, hue + 1.0 / 3.0) as f32,
        hue_to_rgb(p, q, hue) as f32,
        hue_to_rgb(p, q, hue - 1.0 / 3.0) as f32,
    ]
}

/// Neutral gray used for background points in exported geometry.
pub const BACKGROUND_GRAY: [f32; 3] = [0.5, 0.5, 0.5];
