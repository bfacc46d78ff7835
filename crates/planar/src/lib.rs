use std::collections::VecDeque;

use geom_core::{face_attributes, normal_angle, BoundaryPolygon, FaceAdjacency, FaceAttributes};
use mesh_io::Mesh;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum PlanarError {
    #[error("invalid cluster config: {0}")]
    InvalidConfig(String),
    #[error("face attributes ({attributes}) and adjacency ({adjacency}) disagree with mesh of {faces} faces")]
    AttributeMismatch {
        faces: usize,
        attributes: usize,
        adjacency: usize,
    },
    #[error("region {0} has no faces")]
    EmptyRegion(usize),
    #[error(
        "region {region}: face {face} shares an edge with the boundary but has {non_shared} non-shared vertices"
    )]
    MalformedRegion {
        region: usize,
        face: usize,
        non_shared: usize,
    },
}

// --- Clustering ----------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Maximum dihedral angle between neighbouring faces of one region.
    pub angle_tolerance_rad: f64,
    /// Minimum area for a region consisting of a single face.
    pub min_area: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            angle_tolerance_rad: 2.0f64.to_radians(),
            min_area: 1.0,
        }
    }
}

impl ClusterConfig {
    pub fn from_degrees(angle_tolerance_deg: f64, min_area: f64) -> Result<Self, PlanarError> {
        let config = Self {
            angle_tolerance_rad: angle_tolerance_deg.to_radians(),
            min_area,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlanarError> {
        if !self.angle_tolerance_rad.is_finite() || self.angle_tolerance_rad <= 0.0 {
            return Err(PlanarError::InvalidConfig(format!(
                "angle tolerance {} rad must be positive",
                self.angle_tolerance_rad
            )));
        }
        if !self.min_area.is_finite() || self.min_area < 0.0 {
            return Err(PlanarError::InvalidConfig(format!(
                "min area {} must not be negative",
                self.min_area
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Region {
    pub id: usize,
    /// Ascending face indices.
    pub face_indices: Vec<usize>,
    pub area: f64,
}

impl Region {
    pub fn face_count(&self) -> usize {
        self.face_indices.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Clustering {
    pub regions: Vec<Region>,
    /// Singleton faces discarded for lacking a normal or falling below the
    /// area threshold.
    pub dropped_faces: Vec<usize>,
}

impl Clustering {
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn largest_region_size(&self) -> usize {
        self.regions
            .iter()
            .map(Region::face_count)
            .max()
            .unwrap_or(0)
    }
}

/// Builds face attributes and adjacency for `mesh`, then clusters it.
pub fn analyze_regions(mesh: &Mesh, config: &ClusterConfig) -> Result<Clustering, PlanarError> {
    config.validate()?;
    if mesh.face_count() == 0 {
        warn!("mesh has no faces, nothing to cluster");
        return Ok(Clustering::default());
    }
    let attributes = face_attributes(mesh);
    let adjacency = FaceAdjacency::build(mesh);
    cluster_regions(mesh, &attributes, &adjacency, config)
}

pub fn cluster_regions(
    mesh: &Mesh,
    attributes: &[FaceAttributes],
    adjacency: &FaceAdjacency,
    config: &ClusterConfig,
) -> Result<Clustering, PlanarError> {
    config.validate()?;
    let faces = mesh.face_count();
    if attributes.len() != faces || adjacency.face_count() != faces {
        return Err(PlanarError::AttributeMismatch {
            faces,
            attributes: attributes.len(),
            adjacency: adjacency.face_count(),
        });
    }
    if faces == 0 {
        warn!("mesh has no faces, nothing to cluster");
        return Ok(Clustering::default());
    }

    let graph = coplanar_graph(attributes, adjacency, config.angle_tolerance_rad);
    let mut visited = vec![false; faces];
    let mut clustering = Clustering::default();

    for start in 0..faces {
        if visited[start] {
            continue;
        }
        let mut queue = VecDeque::from([start]);
        let mut component = Vec::new();
        visited[start] = true;

        while let Some(face_idx) = queue.pop_front() {
            component.push(face_idx);
            for &neighbor in &graph[face_idx] {
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }

        let area: f64 = component.iter().map(|&f| attributes[f].area).sum();
        // Faces without a normal never gain graph edges, so they only ever
        // show up here as singletons.
        if component.len() == 1
            && (attributes[start].normal.is_none() || area < config.min_area)
        {
            clustering.dropped_faces.push(start);
            continue;
        }
        component.sort_unstable();
        clustering.regions.push(Region {
            id: clustering.regions.len(),
            face_indices: component,
            area,
        });
    }

    debug!(
        regions = clustering.regions.len(),
        dropped = clustering.dropped_faces.len(),
        "clustered planar regions"
    );
    Ok(clustering)
}

/// Adjacency restricted to neighbours whose normals differ by less than the
/// tolerance. Faces without a normal get no edges.
fn coplanar_graph(
    attributes: &[FaceAttributes],
    adjacency: &FaceAdjacency,
    angle_tolerance_rad: f64,
) -> Vec<Vec<usize>> {
    let mut graph = vec![Vec::new(); attributes.len()];
    for &(f1, f2) in adjacency.pairs() {
        let (Some(n1), Some(n2)) = (attributes[f1].normal, attributes[f2].normal) else {
            continue;
        };
        if normal_angle(n1, n2) < angle_tolerance_rad {
            graph[f1].push(f2);
            graph[f2].push(f1);
        }
    }
    graph
}

// --- Exact merge ---------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedLoop {
    pub region_id: usize,
    /// Cyclic vertex loop, no closing duplicate.
    pub vertices: Vec<u32>,
    pub merged_faces: Vec<usize>,
    /// Faces that never shared an edge with the loop and were left out.
    pub leftover_faces: Vec<usize>,
}

impl MergedLoop {
    pub fn to_polygon(&self, mesh: &Mesh) -> BoundaryPolygon {
        BoundaryPolygon {
            region_id: self.region_id,
            points: self
                .vertices
                .iter()
                .map(|&idx| mesh.vertices[idx as usize])
                .collect(),
            vertex_indices: Some(self.vertices.clone()),
        }
    }
}

/// Grows one boundary loop by fusing triangles that share an edge with it.
///
/// The scan restarts after every successful insertion and stops once a full
/// pass over the remaining faces merges nothing. Faces still unmerged at that
/// point are reported as leftovers, not retried.
pub fn merge_region(mesh: &Mesh, region: &Region) -> Result<MergedLoop, PlanarError> {
    let (&seed, rest) = region
        .face_indices
        .split_first()
        .ok_or(PlanarError::EmptyRegion(region.id))?;

    let mut boundary: Vec<u32> = mesh.faces[seed].to_vec();
    let mut merged_faces = vec![seed];
    let mut remaining: Vec<usize> = rest.to_vec();

    loop {
        let mut merged_this_round = None;
        for (pos, &face_idx) in remaining.iter().enumerate() {
            let face = mesh.faces[face_idx];
            let Some((i0, i1)) = shared_edge(&boundary, &face) else {
                continue;
            };
            let shared = [boundary[i0], boundary[i1]];
            let outside: Vec<u32> = face
                .iter()
                .copied()
                .filter(|v| !shared.contains(v))
                .collect();
            if outside.len() != 1 {
                return Err(PlanarError::MalformedRegion {
                    region: region.id,
                    face: face_idx,
                    non_shared: outside.len(),
                });
            }

            let at = insertion_index(i0, i1);
            boundary.insert(at, outside[0]);
            merged_this_round = Some(pos);
            break;
        }

        match merged_this_round {
            Some(pos) => merged_faces.push(remaining.remove(pos)),
            None => break,
        }
    }

    if !remaining.is_empty() {
        debug!(
            region = region.id,
            leftover = remaining.len(),
            "exact merge stopped with unmerged faces"
        );
    }

    Ok(MergedLoop {
        region_id: region.id,
        vertices: boundary,
        merged_faces,
        leftover_faces: remaining,
    })
}

/// Loop positions of the triangle's vertices that are on the loop, in loop
/// order. `Some` only when exactly two are.
fn shared_edge(boundary: &[u32], face: &[u32; 3]) -> Option<(usize, usize)> {
    let mut hits = boundary
        .iter()
        .enumerate()
        .filter(|(_, v)| face.contains(*v))
        .map(|(i, _)| i);
    let first = hits.next()?;
    let second = hits.next()?;
    if hits.next().is_some() {
        return None;
    }
    Some((first, second))
}

/// Where to insert the new vertex for a shared edge at loop positions
/// `i0 < i1`. Consecutive positions take the slot between them; an edge that
/// wraps from the last position back to 0 appends after `i1`.
fn insertion_index(i0: usize, i1: usize) -> usize {
    if i1 - i0 == 1 {
        i1
    } else if i0 == 0 {
        i1 + 1
    } else {
        i0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionFailure {
    pub region_id: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MergeReport {
    pub polygons: Vec<BoundaryPolygon>,
    pub loops: Vec<MergedLoop>,
    pub failures: Vec<RegionFailure>,
}

/// Runs [`merge_region`] on every region; a failing region is recorded and
/// the rest continue.
pub fn merge_regions(mesh: &Mesh, regions: &[Region]) -> MergeReport {
    let mut report = MergeReport::default();
    for region in regions {
        match merge_region(mesh, region) {
            Ok(merged) => {
                report.polygons.push(merged.to_polygon(mesh));
                report.loops.push(merged);
            }
            Err(err) => {
                warn!(region = region.id, %err, "exact merge failed");
                report.failures.push(RegionFailure {
                    region_id: region.id,
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    fn square_mesh() -> Mesh {
        Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [0, 2, 3]],
        }
    }

    fn whole_region(mesh: &Mesh) -> Region {
        Region {
            id: 0,
            face_indices: (0..mesh.face_count()).collect(),
            area: 0.0,
        }
    }

    /// Regular n-gon in the plane z = 3, fanned around vertex 0.
    fn convex_fan(n: usize) -> Mesh {
        let vertices = (0..n)
            .map(|i| {
                let theta = i as f64 / n as f64 * std::f64::consts::TAU;
                [5.0 * theta.cos(), 5.0 * theta.sin(), 3.0]
            })
            .collect();
        let faces = (1..n as u32 - 1).map(|i| [0, i, i + 1]).collect();
        Mesh { vertices, faces }
    }

    fn loop_edges(vertices: &[u32]) -> HashSet<(u32, u32)> {
        (0..vertices.len())
            .map(|i| {
                let a = vertices[i];
                let b = vertices[(i + 1) % vertices.len()];
                (a.min(b), a.max(b))
            })
            .collect()
    }

    #[test]
    fn two_triangles_merge_into_square() {
        let mesh = square_mesh();
        let merged = merge_region(&mesh, &whole_region(&mesh)).expect("merge");
        assert_eq!(merged.vertices, vec![0, 1, 2, 3]);
        assert!(merged.leftover_faces.is_empty());
        let polygon = merged.to_polygon(&mesh);
        assert_eq!(
            polygon.points,
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0]
            ]
        );
    }

    #[test]
    fn convex_fan_reconstructs_true_boundary() {
        for n in [3, 5, 8, 12] {
            let mesh = convex_fan(n);
            let merged = merge_region(&mesh, &whole_region(&mesh)).expect("merge");
            let expected: Vec<u32> = (0..n as u32).collect();
            let got: BTreeSet<u32> = merged.vertices.iter().copied().collect();
            assert_eq!(got, expected.iter().copied().collect());
            assert_eq!(loop_edges(&merged.vertices), loop_edges(&expected));
        }
    }

    #[test]
    fn strip_triangulation_inserts_between_consecutive_vertices() {
        // 0 - 1 - 2 along the bottom, 3 - 4 - 5 along the top
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [2.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
                [2.0, 1.0, 0.0],
            ],
            faces: vec![[0, 1, 4], [0, 4, 3], [1, 2, 5], [1, 5, 4]],
        };
        let merged = merge_region(&mesh, &whole_region(&mesh)).expect("merge");
        assert!(merged.leftover_faces.is_empty());
        assert_eq!(merged.vertices.len(), 6);
        let expected = loop_edges(&[0, 1, 2, 5, 4, 3]);
        assert_eq!(loop_edges(&merged.vertices), expected);
    }

    #[test]
    fn disconnected_faces_are_left_over() {
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [5.0, 0.0, 0.0],
                [6.0, 0.0, 0.0],
                [5.0, 1.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [3, 4, 5]],
        };
        let merged = merge_region(&mesh, &whole_region(&mesh)).expect("merge");
        assert_eq!(merged.vertices, vec![0, 1, 2]);
        assert_eq!(merged.leftover_faces, vec![1]);
    }

    #[test]
    fn repeated_vertex_face_is_malformed() {
        let mesh = Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            faces: vec![[0, 1, 2], [0, 1, 1]],
        };
        let err = merge_region(&mesh, &whole_region(&mesh)).unwrap_err();
        assert_eq!(
            err,
            PlanarError::MalformedRegion {
                region: 0,
                face: 1,
                non_shared: 0
            }
        );
    }

    #[test]
    fn empty_region_is_rejected() {
        let region = Region {
            id: 4,
            face_indices: vec![],
            area: 0.0,
        };
        assert_eq!(
            merge_region(&square_mesh(), &region).unwrap_err(),
            PlanarError::EmptyRegion(4)
        );
    }

    #[test]
    fn merge_regions_keeps_going_after_failure() {
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [0, 1, 1], [1, 3, 2]],
        };
        let regions = vec![
            Region {
                id: 0,
                face_indices: vec![0, 1],
                area: 0.5,
            },
            Region {
                id: 1,
                face_indices: vec![2],
                area: 0.5,
            },
        ];
        let report = merge_regions(&mesh, &regions);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].region_id, 0);
        assert_eq!(report.polygons.len(), 1);
        assert_eq!(report.polygons[0].region_id, 1);
    }

    fn gable_roof() -> Mesh {
        // two roof planes meeting at a ridge along y, plus a tiny sliver
        Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [0.0, 10.0, 0.0],
                [5.0, 0.0, 3.0],
                [5.0, 10.0, 3.0],
                [10.0, 0.0, 0.0],
                [10.0, 10.0, 0.0],
                [20.0, 0.0, 0.0],
                [20.1, 0.0, 0.0],
                [20.0, 0.1, 0.0],
            ],
            faces: vec![
                [0, 2, 3],
                [0, 3, 1],
                [2, 4, 5],
                [2, 5, 3],
                [6, 7, 8],
            ],
        }
    }

    #[test]
    fn gable_roof_splits_at_ridge_and_drops_sliver() {
        let mesh = gable_roof();
        let clustering = analyze_regions(&mesh, &ClusterConfig::default()).expect("cluster");
        assert_eq!(clustering.region_count(), 2);
        assert_eq!(clustering.regions[0].face_indices, vec![0, 1]);
        assert_eq!(clustering.regions[1].face_indices, vec![2, 3]);
        assert_eq!(clustering.dropped_faces, vec![4]);
        assert_eq!(clustering.largest_region_size(), 2);
    }

    #[test]
    fn large_singleton_is_kept() {
        let mesh = Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [4.0, 0.0, 0.0], [0.0, 4.0, 0.0]],
            faces: vec![[0, 1, 2]],
        };
        let clustering = analyze_regions(&mesh, &ClusterConfig::default()).expect("cluster");
        assert_eq!(clustering.region_count(), 1);
        assert!(clustering.dropped_faces.is_empty());
    }

    #[test]
    fn wide_tolerance_joins_ridge() {
        let mesh = gable_roof();
        let config = ClusterConfig::from_degrees(90.0, 1.0).expect("config");
        let clustering = analyze_regions(&mesh, &config).expect("cluster");
        assert_eq!(clustering.region_count(), 1);
        assert_eq!(clustering.regions[0].face_indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn degenerate_faces_never_join_regions() {
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [4.0, 0.0, 0.0],
                [0.0, 4.0, 0.0],
                [8.0, 0.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [0, 1, 3]],
        };
        let clustering = analyze_regions(&mesh, &ClusterConfig::default()).expect("cluster");
        assert_eq!(clustering.region_count(), 1);
        assert_eq!(clustering.regions[0].face_indices, vec![0]);
        assert_eq!(clustering.dropped_faces, vec![1]);
    }

    #[test]
    fn collinear_face_is_dropped_even_without_area_threshold() {
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [4.0, 0.0, 0.0],
                [0.0, 4.0, 0.0],
                [10.0, 0.0, 0.0],
                [11.0, 1.0, 0.0],
                [12.0, 2.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [3, 4, 5]],
        };
        let config = ClusterConfig {
            min_area: 0.0,
            ..ClusterConfig::default()
        };
        let clustering = analyze_regions(&mesh, &config).expect("cluster");
        assert_eq!(clustering.region_count(), 1);
        assert_eq!(clustering.regions[0].face_indices, vec![0]);
        assert_eq!(clustering.dropped_faces, vec![1]);
    }

    #[test]
    fn chord_sharing_face_inserts_before_first_shared_vertex() {
        // After the first two faces the loop is [0, 1, 2, 3]. Face [1, 3, 4]
        // touches loop positions 1 and 3, which are not neighbours.
        let mesh = Mesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
                [2.0, 2.0, 0.0],
            ],
            faces: vec![[0, 1, 2], [0, 2, 3], [1, 3, 4]],
        };
        let merged = merge_region(&mesh, &whole_region(&mesh)).expect("merge");
        assert_eq!(merged.vertices, vec![0, 4, 1, 2, 3]);
        assert_eq!(merged.merged_faces, vec![0, 1, 2]);
    }

    #[test]
    fn clustering_is_idempotent() {
        let mesh = gable_roof();
        let config = ClusterConfig::default();
        let first = analyze_regions(&mesh, &config).expect("cluster");
        let second = analyze_regions(&mesh, &config).expect("cluster");
        assert_eq!(first, second);
    }

    #[test]
    fn empty_mesh_yields_no_regions() {
        let clustering = analyze_regions(&Mesh::new(), &ClusterConfig::default()).expect("ok");
        assert_eq!(clustering, Clustering::default());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            ClusterConfig::from_degrees(0.0, 1.0),
            Err(PlanarError::InvalidConfig(_))
        ));
        assert!(matches!(
            ClusterConfig::from_degrees(1.0, -1.0),
            Err(PlanarError::InvalidConfig(_))
        ));
    }

    #[test]
    fn mismatched_attributes_are_rejected() {
        let mesh = square_mesh();
        let adjacency = FaceAdjacency::build(&mesh);
        let err = cluster_regions(&mesh, &[], &adjacency, &ClusterConfig::default()).unwrap_err();
        assert!(matches!(err, PlanarError::AttributeMismatch { faces: 2, .. }));
    }
}
