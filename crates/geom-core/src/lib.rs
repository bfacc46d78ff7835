//! Mesh and adjacency model shared by the reconstruction crates.
//!
//! Face normals and areas are derived from the current vertex positions on
//! every call and never stored on the [`Mesh`] itself.

use std::collections::HashMap;

use mesh_io::{Face, Mesh, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Faces whose doubled area falls below this are treated as degenerate.
pub const DEGENERATE_EPSILON: f64 = 1e-12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("face {face} references vertex {index} but mesh has {vertex_count} vertices")]
    IndexOutOfBounds {
        face: usize,
        index: u32,
        vertex_count: usize,
    },
}

pub fn validate_mesh(mesh: &Mesh) -> Result<(), TopologyError> {
    for (face_idx, face) in mesh.faces.iter().enumerate() {
        if let Some(&index) = face
            .iter()
            .find(|&&idx| (idx as usize) >= mesh.vertex_count())
        {
            return Err(TopologyError::IndexOutOfBounds {
                face: face_idx,
                index,
                vertex_count: mesh.vertex_count(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshStats {
    pub vertices: usize,
    pub faces: usize,
    pub degenerate_faces: usize,
}

pub fn mesh_stats(mesh: &Mesh) -> MeshStats {
    let degenerate_faces = face_attributes(mesh)
        .iter()
        .filter(|attr| attr.normal.is_none())
        .count();
    MeshStats {
        vertices: mesh.vertex_count(),
        faces: mesh.face_count(),
        degenerate_faces,
    }
}

// --- Face attributes -----------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FaceAttributes {
    /// Unit normal, `None` for collinear or repeated-vertex faces.
    pub normal: Option<[f64; 3]>,
    pub area: f64,
}

pub fn face_attributes(mesh: &Mesh) -> Vec<FaceAttributes> {
    (0..mesh.face_count())
        .map(|face| face_attribute(mesh, face))
        .collect()
}

pub fn face_attribute(mesh: &Mesh, face: usize) -> FaceAttributes {
    let [a, b, c] = mesh.face_points(face);
    let raw = cross(sub(b, a), sub(c, a));
    let len = length(raw);
    FaceAttributes {
        normal: (len > DEGENERATE_EPSILON).then(|| scale(raw, 1.0 / len)),
        area: 0.5 * len,
    }
}

/// Angle in radians between two unit normals.
pub fn normal_angle(a: [f64; 3], b: [f64; 3]) -> f64 {
    dot(a, b).clamp(-1.0, 1.0).acos()
}

// --- Adjacency -----------------------------------------------------------

/// Face adjacency graph: two faces are neighbours iff they share exactly two
/// vertex indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceAdjacency {
    neighbors: Vec<Vec<usize>>,
    pairs: Vec<(usize, usize)>,
}

impl FaceAdjacency {
    pub fn build(mesh: &Mesh) -> Self {
        let mut edge_faces: HashMap<(u32, u32), Vec<usize>> = HashMap::new();
        for (face_idx, face) in mesh.faces.iter().enumerate() {
            for key in distinct_edges(face) {
                edge_faces.entry(key).or_default().push(face_idx);
            }
        }

        let mut candidates = Vec::new();
        for faces in edge_faces.values() {
            for (i, &f1) in faces.iter().enumerate() {
                for &f2 in &faces[i + 1..] {
                    candidates.push((f1.min(f2), f1.max(f2)));
                }
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        let mut neighbors = vec![Vec::new(); mesh.face_count()];
        let mut pairs = Vec::with_capacity(candidates.len());
        for (f1, f2) in candidates {
            if shared_vertex_count(&mesh.faces[f1], &mesh.faces[f2]) != 2 {
                continue;
            }
            neighbors[f1].push(f2);
            neighbors[f2].push(f1);
            pairs.push((f1, f2));
        }

        Self { neighbors, pairs }
    }

    pub fn face_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self, face: usize) -> &[usize] {
        &self.neighbors[face]
    }

    /// Adjacent face pairs `(f1, f2)` with `f1 < f2`, sorted.
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }
}

fn distinct_edges(face: &Face) -> Vec<(u32, u32)> {
    let mut edges: Vec<(u32, u32)> = [(face[0], face[1]), (face[1], face[2]), (face[2], face[0])]
        .into_iter()
        .filter(|(a, b)| a != b)
        .map(|(a, b)| (a.min(b), a.max(b)))
        .collect();
    edges.sort_unstable();
    edges.dedup();
    edges
}

fn shared_vertex_count(a: &Face, b: &Face) -> usize {
    let mut distinct = a.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    distinct.iter().filter(|idx| b.contains(idx)).count()
}

// --- Construction helpers ------------------------------------------------

/// Fans each polygon into triangles around its first vertex. Vertices are
/// deduplicated on exact coordinates and a closing duplicate of the first
/// vertex is ignored.
pub fn mesh_from_polygons(polygons: &[Vec<Point>]) -> Mesh {
    let mut mesh = Mesh::new();
    let mut lookup: HashMap<[u64; 3], u32> = HashMap::new();

    for polygon in polygons {
        let mut ring: &[Point] = polygon;
        if ring.len() > 1 && ring.first() == ring.last() {
            ring = &ring[..ring.len() - 1];
        }
        if ring.len() < 3 {
            continue;
        }
        let indices: Vec<u32> = ring
            .iter()
            .map(|p| upsert_vertex(*p, &mut lookup, &mut mesh.vertices))
            .collect();
        for i in 1..indices.len() - 1 {
            mesh.faces.push([indices[0], indices[i], indices[i + 1]]);
        }
    }

    mesh
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WeldReport {
    pub merged_vertices: usize,
    pub dropped_faces: usize,
}

/// Merges vertices with bit-identical coordinates so that vertex index
/// identity matches positional identity. Faces that collapse are dropped.
pub fn weld_vertices(mesh: &mut Mesh) -> WeldReport {
    let mut lookup: HashMap<[u64; 3], u32> = HashMap::new();
    let mut welded = Vec::with_capacity(mesh.vertices.len());
    let remap: Vec<u32> = mesh
        .vertices
        .iter()
        .map(|v| upsert_vertex(*v, &mut lookup, &mut welded))
        .collect();
    let merged_vertices = mesh.vertices.len() - welded.len();
    mesh.vertices = welded;

    let before = mesh.faces.len();
    mesh.faces.retain_mut(|face| {
        for idx in face.iter_mut() {
            *idx = remap[*idx as usize];
        }
        face[0] != face[1] && face[1] != face[2] && face[0] != face[2]
    });

    WeldReport {
        merged_vertices,
        dropped_faces: before - mesh.faces.len(),
    }
}

fn upsert_vertex(vertex: Point, lookup: &mut HashMap<[u64; 3], u32>, vertices: &mut Vec<Point>) -> u32 {
    // -0.0 and 0.0 compare equal, so normalise before hashing bits.
    let key = vertex.map(|f| if f == 0.0 { 0u64 } else { f.to_bits() });
    *lookup.entry(key).or_insert_with(|| {
        vertices.push(vertex);
        (vertices.len() - 1) as u32
    })
}

// --- Boundary polygons ---------------------------------------------------

/// Ordered, cyclic outline of one region. No closing duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundaryPolygon {
    pub region_id: usize,
    pub points: Vec<Point>,
    /// Mesh vertex indices, present when the loop was built from mesh edges.
    pub vertex_indices: Option<Vec<u32>>,
}

impl BoundaryPolygon {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Projection onto the x–y plane.
    pub fn footprint(&self) -> Vec<[f64; 2]> {
        self.points.iter().map(|p| [p[0], p[1]]).collect()
    }
}

// --- Vector helpers ------------------------------------------------------

pub fn sub(a: Point, b: Point) -> Point {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn cross(a: Point, b: Point) -> Point {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn dot(a: Point, b: Point) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn length(v: Point) -> f64 {
    dot(v, v).sqrt()
}

fn scale(v: Point, s: f64) -> Point {
    [v[0] * s, v[1] * s, v[2] * s]
}
