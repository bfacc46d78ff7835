use clap::ValueEnum;
use fit::hull_region;
use geom_core::{mesh_stats, BoundaryPolygon, MeshStats};
use mesh_io::{Mesh, PolygonMesh};
use planar::{analyze_regions, merge_region, ClusterConfig, PlanarError, RegionFailure};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fuse triangles along shared edges, keeping concave outlines.
    Exact,
    /// Convex hull of each region in its best-fit plane.
    Hull,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconstruction {
    pub strategy: Strategy,
    pub stats: MeshStats,
    pub regions: usize,
    pub dropped_faces: usize,
    pub leftover_faces: usize,
    pub fallbacks: usize,
    pub failures: Vec<RegionFailure>,
    #[serde(skip)]
    pub polygons: Vec<BoundaryPolygon>,
}

impl Reconstruction {
    pub fn polygon_count(&self) -> usize {
        self.polygons.len()
    }

    /// Polygon outlines projected onto the x–y plane.
    pub fn footprints(&self) -> Vec<Vec<[f64; 2]>> {
        self.polygons.iter().map(BoundaryPolygon::footprint).collect()
    }
}

/// Clusters `mesh` into planar regions and outlines each one.
///
/// With [`Strategy::Exact`] and `fallback_hull`, a region whose exact merge
/// fails is outlined by its hull instead. Regions that fail both ways are
/// recorded in [`Reconstruction::failures`].
pub fn reconstruct_roof(
    mesh: &Mesh,
    config: &ClusterConfig,
    strategy: Strategy,
    fallback_hull: bool,
) -> Result<Reconstruction, PlanarError> {
    let clustering = analyze_regions(mesh, config)?;
    let mut out = Reconstruction {
        strategy,
        stats: mesh_stats(mesh),
        regions: clustering.region_count(),
        dropped_faces: clustering.dropped_faces.len(),
        leftover_faces: 0,
        fallbacks: 0,
        failures: Vec::new(),
        polygons: Vec::with_capacity(clustering.region_count()),
    };

    for region in &clustering.regions {
        let outcome = match strategy {
            Strategy::Hull => hull_region(mesh, region)
                .map(|hull| hull.polygon)
                .map_err(|err| err.to_string()),
            Strategy::Exact => match merge_region(mesh, region) {
                Ok(merged) => {
                    out.leftover_faces += merged.leftover_faces.len();
                    Ok(merged.to_polygon(mesh))
                }
                Err(err) if fallback_hull => {
                    debug!(region = region.id, %err, "falling back to hull");
                    out.fallbacks += 1;
                    hull_region(mesh, region)
                        .map(|hull| hull.polygon)
                        .map_err(|hull_err| format!("{err}; hull fallback: {hull_err}"))
                }
                Err(err) => Err(err.to_string()),
            },
        };
        match outcome {
            Ok(polygon) => out.polygons.push(polygon),
            Err(reason) => out.failures.push(RegionFailure {
                region_id: region.id,
                reason,
            }),
        }
    }

    info!(
        regions = out.regions,
        polygons = out.polygons.len(),
        failures = out.failures.len(),
        "reconstructed roof outline"
    );
    Ok(out)
}

/// OBJ-ready polygons. Loops that all come from mesh edges share the mesh's
/// vertex list; otherwise every polygon gets its own vertices.
pub fn polygon_mesh(mesh: &Mesh, polygons: &[BoundaryPolygon]) -> PolygonMesh {
    let indexed: Option<Vec<Vec<u32>>> = polygons
        .iter()
        .map(|polygon| polygon.vertex_indices.clone())
        .collect();
    match indexed {
        Some(faces) => PolygonMesh {
            vertices: mesh.vertices.clone(),
            faces,
        },
        None => PolygonMesh::from_polygons(polygons.iter().map(|p| p.points.as_slice())),
    }
}
