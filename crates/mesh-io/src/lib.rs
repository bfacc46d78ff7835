use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub type Point = [f64; 3];
pub type Face = [u32; 3];

/// Minimal triangle mesh container used by downstream crates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Point>,
    pub faces: Vec<Face>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.faces.is_empty()
    }

    pub fn face_points(&self, face: usize) -> [Point; 3] {
        let [a, b, c] = self.faces[face];
        [
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        ]
    }
}

/// Polygon soup with arbitrary face arity, as written to OBJ.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolygonMesh {
    pub vertices: Vec<Point>,
    pub faces: Vec<Vec<u32>>,
}

impl PolygonMesh {
    /// Each polygon gets its own vertex run; vertices are not shared.
    pub fn from_polygons<'a>(polygons: impl IntoIterator<Item = &'a [Point]>) -> Self {
        let mut mesh = Self::default();
        for polygon in polygons {
            let start = mesh.vertices.len() as u32;
            mesh.vertices.extend_from_slice(polygon);
            mesh.faces
                .push((start..start + polygon.len() as u32).collect());
        }
        mesh
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshLoadReport {
    pub dropped_faces: usize,
}

#[derive(Debug, Error)]
pub enum MeshIoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("unsupported format: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub struct LoadedMesh {
    pub mesh: Mesh,
    pub report: MeshLoadReport,
    pub path: PathBuf,
}

/// Drops faces referencing vertices that do not exist.
pub fn sanitize(mesh: &mut Mesh) -> MeshLoadReport {
    let vertex_count = mesh.vertices.len();
    let before = mesh.faces.len();
    mesh.faces
        .retain(|face| face.iter().all(|&idx| (idx as usize) < vertex_count));
    MeshLoadReport {
        dropped_faces: before - mesh.faces.len(),
    }
}

pub fn load_mesh(path: impl AsRef<Path>) -> Result<LoadedMesh, MeshIoError> {
    let path = path.as_ref();
    let lower_ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    match lower_ext.as_str() {
        "obj" => load_obj(path),
        other => Err(MeshIoError::Unsupported(if other.is_empty() {
            "unknown".to_string()
        } else {
            other.to_string()
        })),
    }
}

pub fn load_obj(path: impl AsRef<Path>) -> Result<LoadedMesh, MeshIoError> {
    let text = fs::read_to_string(&path)?;
    let mut mesh = parse_obj(&text)?;
    let report = sanitize(&mut mesh);
    if report.dropped_faces > 0 {
        debug!(
            dropped = report.dropped_faces,
            path = %path.as_ref().display(),
            "dropped faces with out-of-range indices"
        );
    }
    Ok(LoadedMesh {
        mesh,
        report,
        path: path.as_ref().to_path_buf(),
    })
}

pub fn parse_obj(source: &str) -> Result<Mesh, MeshIoError> {
    let mut vertices = Vec::new();
    let mut faces = Vec::new();

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        match parts.next() {
            Some("v") => {
                let coords = parse_point(parts.collect::<Vec<_>>().as_slice())?;
                vertices.push(coords);
            }
            Some("f") => {
                let face_indices = parts
                    .map(parse_face_index)
                    .collect::<Result<Vec<_>, _>>()?;
                triangulate_face(&face_indices, &mut faces)?;
            }
            _ => continue,
        }
    }

    if vertices.is_empty() || faces.is_empty() {
        return Err(MeshIoError::Invalid("OBJ missing vertices or faces".into()));
    }

    Ok(Mesh { vertices, faces })
}

fn parse_face_index(token: &str) -> Result<u32, MeshIoError> {
    let idx = token
        .split('/')
        .next()
        .ok_or_else(|| MeshIoError::Invalid("invalid face index".into()))?;
    let value =
        i64::from_str(idx).map_err(|_| MeshIoError::Invalid("invalid face index".into()))?;
    if value <= 0 {
        return Err(MeshIoError::Invalid(
            "relative or zero face indices unsupported".into(),
        ));
    }
    u32::try_from(value - 1).map_err(|_| MeshIoError::Invalid("face index overflow".into()))
}

fn parse_point(parts: &[&str]) -> Result<Point, MeshIoError> {
    if parts.len() < 3 {
        return Err(MeshIoError::Invalid("vertex missing coordinates".into()));
    }

    let parse = |s: &str| {
        f64::from_str(s).map_err(|_| MeshIoError::Invalid(format!("invalid float '{s}'")))
    };
    Ok([parse(parts[0])?, parse(parts[1])?, parse(parts[2])?])
}

fn triangulate_face(indices: &[u32], faces: &mut Vec<Face>) -> Result<(), MeshIoError> {
    if indices.len() < 3 {
        return Err(MeshIoError::Invalid("face must have >=3 vertices".into()));
    }
    for i in 1..indices.len() - 1 {
        faces.push([indices[0], indices[i], indices[i + 1]]);
    }
    Ok(())
}

pub fn format_obj(mesh: &PolygonMesh) -> String {
    let mut out = String::new();
    for v in &mesh.vertices {
        let _ = writeln!(out, "v {} {} {}", v[0], v[1], v[2]);
    }
    for face in &mesh.faces {
        out.push('f');
        for idx in face {
            let _ = write!(out, " {}", idx + 1);
        }
        out.push('\n');
    }
    out
}

pub fn write_obj(path: impl AsRef<Path>, mesh: &PolygonMesh) -> Result<(), MeshIoError> {
    fs::write(path, format_obj(mesh))?;
    Ok(())
}

// --- Point clouds --------------------------------------------------------

/// Reads whitespace separated `x y z` lines. Lines that do not parse are
/// skipped, a leading UTF-8 byte order mark is ignored.
pub fn load_xyz(path: impl AsRef<Path>) -> Result<Vec<Point>, MeshIoError> {
    let text = fs::read_to_string(&path)?;
    let (points, skipped) = parse_xyz(&text);
    if skipped > 0 {
        debug!(
            skipped,
            path = %path.as_ref().display(),
            "skipped unparsable point lines"
        );
    }
    Ok(points)
}

pub fn parse_xyz(source: &str) -> (Vec<Point>, usize) {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let mut points = Vec::new();
    let mut skipped = 0usize;
    for line in source.lines() {
        let parts: Vec<_> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        if parts.len() != 3 {
            skipped += 1;
            continue;
        }
        match parse_point(&parts) {
            Ok(point) => points.push(point),
            Err(_) => skipped += 1,
        }
    }
    (points, skipped)
}

// --- Grids ---------------------------------------------------------------

/// Row-major grid as CSV, two decimals, `nan` for missing cells.
pub fn format_grid_csv(cols: usize, values: &[f64]) -> String {
    format_rows(cols, values, |out, v| {
        if v.is_nan() {
            out.push_str("nan");
        } else {
            let _ = write!(out, "{v:.2}");
        }
    })
}

pub fn format_mask_csv(cols: usize, cells: &[bool]) -> String {
    format_rows(cols, cells, |out, v| out.push(if *v { '1' } else { '0' }))
}

fn format_rows<T>(cols: usize, values: &[T], mut cell: impl FnMut(&mut String, &T)) -> String {
    let mut out = String::new();
    if cols == 0 {
        return out;
    }
    for row in values.chunks(cols) {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            cell(&mut out, value);
        }
        out.push('\n');
    }
    out
}

pub fn write_grid_csv(
    path: impl AsRef<Path>,
    cols: usize,
    values: &[f64],
) -> Result<(), MeshIoError> {
    fs::write(path, format_grid_csv(cols, values))?;
    Ok(())
}

pub fn write_mask_csv(
    path: impl AsRef<Path>,
    cols: usize,
    cells: &[bool],
) -> Result<(), MeshIoError> {
    fs::write(path, format_mask_csv(cols, cells))?;
    Ok(())
}
