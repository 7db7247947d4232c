//! Voxel quantization: the bidirectional mapping between full-resolution
//! point indices and deduplicated voxel indices.

use std::collections::HashMap;

use tracing::debug;
use voxelseg_core::{Error, Result};

/// Bidirectional full-resolution / voxel mapping for one loaded geometry.
///
/// `forward[full] -> voxel` is many-to-one; `representative[voxel]` is the
/// first full index that quantized into the cell and seeds the per-voxel
/// position and color.
#[derive(Debug, Clone)]
pub struct VoxelMap {
    forward: Vec<usize>,
    representative: Vec<usize>,
    positions: Vec<[f64; 3]>,
    colors: Vec<[f32; 3]>,
}

impl VoxelMap {
    pub fn voxel_count(&self) -> usize {
        self.positions.len()
    }

    pub fn full_count(&self) -> usize {
        self.forward.len()
    }

    /// Voxel index every full-resolution point quantized into.
    pub fn forward(&self) -> &[usize] {
        &self.forward
    }

    /// Representative full-resolution index per voxel.
    pub fn representative(&self) -> &[usize] {
        &self.representative
    }

    /// Representative position per voxel, in original coordinates.
    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    /// Representative color per voxel.
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors
    }

    /// Broadcast a voxel-space label array back to full resolution: every
    /// full point takes the label of the voxel it quantized into.
    pub fn broadcast(&self, voxel_labels: &[u32]) -> Vec<u32> {
        debug_assert_eq!(voxel_labels.len(), self.voxel_count());
        self.forward.iter().map(|&v| voxel_labels[v]).collect()
    }
}

/// Builds a [`VoxelMap`] by quantizing coordinates to a fixed cell size.
pub struct VoxelMapper {
    voxel_size: f64,
}

impl VoxelMapper {
    pub fn new(voxel_size: f64) -> Self {
        Self { voxel_size }
    }

    /// Quantize `coords` into voxels.
    ///
    /// Pure function of the inputs: cell keys are `floor(coord / size)` per
    /// axis and voxel indices follow first occurrence in point order, so
    /// identical input always yields an identical mapping.
    pub fn build(&self, coords: &[[f64; 3]], colors: &[[f32; 3]]) -> Result<VoxelMap> {
        if coords.is_empty() {
            return Err(Error::GeometryEmpty);
        }
        debug_assert_eq!(coords.len(), colors.len());

        let mut cells: HashMap<[i64; 3], usize> = HashMap::new();
        let mut forward = Vec::with_capacity(coords.len());
        let mut representative = Vec::new();
        let mut positions = Vec::new();
        let mut voxel_colors = Vec::new();

        for (full_idx, point) in coords.iter().enumerate() {
            let key = [
                (point[0] / self.voxel_size).floor() as i64,
                (point[1] / self.voxel_size).floor() as i64,
                (point[2] / self.voxel_size).floor() as i64,
            ];
            let voxel_idx = *cells.entry(key).or_insert_with(|| {
                representative.push(full_idx);
                positions.push(*point);
                voxel_colors.push(colors[full_idx]);
                positions.len() - 1
            });
            forward.push(voxel_idx);
        }

        debug!(
            full = coords.len(),
            voxels = positions.len(),
            voxel_size = self.voxel_size,
            "Built voxel map"
        );

        Ok(VoxelMap {
            forward,
            representative,
            positions,
            colors: voxel_colors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(n: usize) -> Vec<[f32; 3]> {
        vec![[0.5; 3]; n]
    }

    #[test]
    fn test_empty_geometry_rejected() {
        let mapper = VoxelMapper::new(0.05);
        assert!(matches!(
            mapper.build(&[], &[]),
            Err(Error::GeometryEmpty)
        ));
    }

    #[test]
    fn test_points_in_same_cell_share_voxel() {
        let coords = vec![[0.01, 0.01, 0.01], [0.02, 0.02, 0.02], [1.0, 1.0, 1.0]];
        let map = VoxelMapper::new(0.05).build(&coords, &gray(3)).unwrap();
        assert_eq!(map.voxel_count(), 2);
        assert_eq!(map.forward(), &[0, 0, 1]);
        assert_eq!(map.representative(), &[0, 2]);
        // Representative seeds position and color.
        assert_eq!(map.positions()[0], [0.01, 0.01, 0.01]);
    }

    #[test]
    fn test_every_full_index_maps_and_every_voxel_is_reachable() {
        let coords: Vec<[f64; 3]> = (0..100)
            .map(|i| [i as f64 * 0.013, (i % 7) as f64 * 0.021, 0.0])
            .collect();
        let map = VoxelMapper::new(0.05).build(&coords, &gray(100)).unwrap();
        assert_eq!(map.full_count(), 100);
        let mut seen = vec![false; map.voxel_count()];
        for &v in map.forward() {
            assert!(v < map.voxel_count());
            seen[v] = true;
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_determinism_law() {
        let coords: Vec<[f64; 3]> = (0..500)
            .map(|i| {
                let f = i as f64;
                [(f * 0.37).sin(), (f * 0.11).cos(), (f * 0.053).sin()]
            })
            .collect();
        let a = VoxelMapper::new(0.05).build(&coords, &gray(500)).unwrap();
        let b = VoxelMapper::new(0.05).build(&coords, &gray(500)).unwrap();
        assert_eq!(a.forward(), b.forward());
        assert_eq!(a.representative(), b.representative());
        assert_eq!(a.positions(), b.positions());
    }

    #[test]
    fn test_broadcast() {
        let coords = vec![[0.0, 0.0, 0.0], [0.01, 0.0, 0.0], [1.0, 0.0, 0.0]];
        let map = VoxelMapper::new(0.05).build(&coords, &gray(3)).unwrap();
        assert_eq!(map.broadcast(&[7, 3]), vec![7, 7, 3]);
    }

    #[test]
    fn test_negative_coordinates_quantize_separately() {
        // floor() keeps cells on either side of the origin distinct.
        let coords = vec![[-0.01, 0.0, 0.0], [0.01, 0.0, 0.0]];
        let map = VoxelMapper::new(0.05).build(&coords, &gray(2)).unwrap();
        assert_eq!(map.voxel_count(), 2);
    }
}
