//! Geometry I/O seam and the ASCII PLY implementation behind it.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};
use voxelseg_core::{Error, Geometry, Result};

/// A loaded scene: the geometry plus whatever topology the file carried.
/// Triangles are kept only so exports can reproduce them; the engine never
/// interprets them.
#[derive(Debug, Clone)]
pub struct Scene {
    pub geometry: Geometry,
    pub faces: Vec<[u32; 3]>,
}

/// Geometry parsing/serialization collaborator.
pub trait GeometryCodec: Send + Sync {
    /// Parse a scene file; mesh inputs set `Geometry::is_surface`.
    fn read_scene(&self, path: &Path) -> Result<Scene>;

    /// Write the scene's coordinates (and faces, for meshes) with the given
    /// per-point colors.
    fn write_scene(
        &self,
        path: &Path,
        coords: &[[f64; 3]],
        colors: &[[f32; 3]],
        faces: &[[u32; 3]],
    ) -> Result<()>;

    /// File extension produced by `write_scene`.
    fn extension(&self) -> &'static str;
}

/// ASCII PLY codec: the interchange format of the reference tooling.
#[derive(Debug, Default)]
pub struct AsciiPlyCodec;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ColorKind {
    None,
    Uchar,
    Float,
}

impl GeometryCodec for AsciiPlyCodec {
    fn read_scene(&self, path: &Path) -> Result<Scene> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim() != "ply" {
            return Err(Error::GeometryFormat(format!(
                "{}: missing ply magic",
                path.display()
            )));
        }

        let mut vertex_count = 0usize;
        let mut face_count = 0usize;
        let mut color_kind = ColorKind::None;
        let mut in_vertex_element = false;

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(Error::GeometryFormat(format!(
                    "{}: truncated header",
                    path.display()
                )));
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["format", kind, _] => {
                    if *kind != "ascii" {
                        return Err(Error::GeometryFormat(format!(
                            "{}: unsupported format {:?}",
                            path.display(),
                            kind
                        )));
                    }
                }
                ["element", "vertex", n] => {
                    vertex_count = n.parse().map_err(|_| {
                        Error::GeometryFormat(format!("{}: bad vertex count", path.display()))
                    })?;
                    in_vertex_element = true;
                }
                ["element", "face", n] => {
                    face_count = n.parse().map_err(|_| {
                        Error::GeometryFormat(format!("{}: bad face count", path.display()))
                    })?;
                    in_vertex_element = false;
                }
                ["element", ..] => in_vertex_element = false,
                ["property", kind, "red"] if in_vertex_element => {
                    color_kind = if *kind == "uchar" || *kind == "uint8" {
                        ColorKind::Uchar
                    } else {
                        ColorKind::Float
                    };
                }
                ["end_header"] => break,
                _ => {}
            }
        }

        if vertex_count == 0 {
            return Err(Error::GeometryEmpty);
        }

        let mut coords = Vec::with_capacity(vertex_count);
        let mut colors = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(Error::GeometryFormat(format!(
                    "{}: truncated vertex data",
                    path.display()
                )));
            }
            let values: Vec<f64> = line
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| {
                    Error::GeometryFormat(format!("{}: bad vertex line", path.display()))
                })?;
            if values.len() < 3 {
                return Err(Error::GeometryFormat(format!(
                    "{}: vertex line has fewer than 3 values",
                    path.display()
                )));
            }
            coords.push([values[0], values[1], values[2]]);
            colors.push(match color_kind {
                ColorKind::None => [0.5, 0.5, 0.5],
                _ if values.len() < 6 => [0.5, 0.5, 0.5],
                ColorKind::Uchar => [
                    (values[3] / 255.0) as f32,
                    (values[4] / 255.0) as f32,
                    (values[5] / 255.0) as f32,
                ],
                _ => [values[3] as f32, values[4] as f32, values[5] as f32],
            });
        }

        let mut faces = Vec::with_capacity(face_count);
        for _ in 0..face_count {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Err(Error::GeometryFormat(format!(
                    "{}: truncated face data",
                    path.display()
                )));
            }
            let values: Vec<u32> = line
                .split_whitespace()
                .map(|t| t.parse::<u32>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| {
                    Error::GeometryFormat(format!("{}: bad face line", path.display()))
                })?;
            // "3 a b c" triangle rows; other polygon sizes are not produced
            // by the reference tooling.
            if values.len() == 4 && values[0] == 3 {
                faces.push([values[1], values[2], values[3]]);
            }
        }

        let is_surface = !faces.is_empty();
        info!(
            path = %path.display(),
            vertices = coords.len(),
            faces = faces.len(),
            is_surface,
            "Loaded geometry"
        );

        Ok(Scene {
            geometry: Geometry {
                coords,
                colors,
                is_surface,
            },
            faces,
        })
    }

    fn write_scene(
        &self,
        path: &Path,
        coords: &[[f64; 3]],
        colors: &[[f32; 3]],
        faces: &[[u32; 3]],
    ) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        writeln!(w, "ply")?;
        writeln!(w, "format ascii 1.0")?;
        writeln!(w, "element vertex {}", coords.len())?;
        writeln!(w, "property double x")?;
        writeln!(w, "property double y")?;
        writeln!(w, "property double z")?;
        writeln!(w, "property uchar red")?;
        writeln!(w, "property uchar green")?;
        writeln!(w, "property uchar blue")?;
        if !faces.is_empty() {
            writeln!(w, "element face {}", faces.len())?;
            writeln!(w, "property list uchar uint vertex_indices")?;
        }
        writeln!(w, "end_header")?;

        for (point, color) in coords.iter().zip(colors.iter()) {
            let r = (color[0].clamp(0.0, 1.0) * 255.0).round() as u8;
            let g = (color[1].clamp(0.0, 1.0) * 255.0).round() as u8;
            let b = (color[2].clamp(0.0, 1.0) * 255.0).round() as u8;
            writeln!(
                w,
                "{} {} {} {} {} {}",
                point[0], point[1], point[2], r, g, b
            )?;
        }
        for face in faces {
            writeln!(w, "3 {} {} {}", face[0], face[1], face[2])?;
        }
        w.flush()?;

        debug!(path = %path.display(), vertices = coords.len(), "Wrote geometry");
        Ok(())
    }

    fn extension(&self) -> &'static str {
        "ply"
    }
}
