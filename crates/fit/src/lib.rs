use std::cmp::Ordering;
use std::collections::HashSet;

use geom_core::BoundaryPolygon;
use mesh_io::{Mesh, Point};
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use planar::{Region, RegionFailure};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Hulls with a smaller area than this are treated as degenerate.
pub const MIN_HULL_AREA: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum HullError {
    #[error("region {region} has {count} unique vertices, need at least 3")]
    TooFewVertices { region: usize, count: usize },
    #[error("region {region} projects to a degenerate hull (area {area:.3e})")]
    DegenerateHull { region: usize, area: f64 },
    #[error("cannot fit a plane to {0} points")]
    EmptyPointSet(usize),
}

// --- Plane projection ----------------------------------------------------

/// Best-fit 2D frame of a point set: the centroid plus the two directions of
/// greatest variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneProjection {
    pub origin: Vector3<f64>,
    pub u_axis: Vector3<f64>,
    pub v_axis: Vector3<f64>,
    pub normal: Vector3<f64>,
    /// Eigenvalues of the scatter matrix, largest first.
    pub variances: [f64; 3],
    /// Root mean square distance of the input points to the plane.
    pub rms: f64,
}

impl PlaneProjection {
    pub fn fit(points: &[Point]) -> Result<Self, HullError> {
        if points.is_empty() {
            return Err(HullError::EmptyPointSet(0));
        }
        let points: Vec<Vector3<f64>> = points.iter().map(|p| Vector3::from(*p)).collect();
        let centroid =
            points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / points.len() as f64;
        let mut cov = Matrix3::zeros();
        for p in &points {
            let v = p - centroid;
            cov += v * v.transpose();
        }
        let eigen = SymmetricEigen::new(cov);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(Ordering::Equal)
        });

        let u_axis = eigen.eigenvectors.column(order[0]).normalize();
        let v_axis = eigen.eigenvectors.column(order[1]).normalize();
        let normal = u_axis.cross(&v_axis);
        let sum_sq: f64 = points
            .iter()
            .map(|p| (p - centroid).dot(&normal).powi(2))
            .sum();

        Ok(Self {
            origin: centroid,
            u_axis,
            v_axis,
            normal,
            variances: order.map(|i| eigen.eigenvalues[i].max(0.0)),
            rms: (sum_sq / points.len() as f64).sqrt(),
        })
    }

    pub fn project(&self, point: Point) -> [f64; 2] {
        let delta = Vector3::from(point) - self.origin;
        [delta.dot(&self.u_axis), delta.dot(&self.v_axis)]
    }

    /// Inverse of [`PlaneProjection::project`] for points on the plane.
    pub fn lift(&self, uv: [f64; 2]) -> Point {
        let p = self.origin + self.u_axis * uv[0] + self.v_axis * uv[1];
        [p.x, p.y, p.z]
    }
}

// --- Convex hull ---------------------------------------------------------

/// Monotone chain hull, counter-clockwise, collinear points removed. Returns
/// indices into `points`.
pub fn convex_hull(points: &[[f64; 2]]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        points[a][0]
            .partial_cmp(&points[b][0])
            .unwrap_or(Ordering::Equal)
            .then(points[a][1].partial_cmp(&points[b][1]).unwrap_or(Ordering::Equal))
    });
    order.dedup_by(|a, b| points[*a] == points[*b]);
    if order.len() < 3 {
        return order;
    }

    let mut lower: Vec<usize> = Vec::new();
    for &p in &order {
        while lower.len() >= 2
            && cross_2d(points[lower[lower.len() - 2]], points[lower[lower.len() - 1]], points[p])
                <= 0.0
        {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<usize> = Vec::new();
    for &p in order.iter().rev() {
        while upper.len() >= 2
            && cross_2d(points[upper[upper.len() - 2]], points[upper[upper.len() - 1]], points[p])
                <= 0.0
        {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn cross_2d(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Shoelace area, positive for counter-clockwise rings.
pub fn signed_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        twice += a[0] * b[1] - b[0] * a[1];
    }
    0.5 * twice
}

// --- Region hulls --------------------------------------------------------

/// Distinct vertex positions of a region, first occurrence order.
pub fn unique_region_points(mesh: &Mesh, region: &Region) -> Vec<Point> {
    let mut seen = HashSet::new();
    let mut points = Vec::new();
    for &face_idx in &region.face_indices {
        for p in mesh.face_points(face_idx) {
            let key = p.map(|f| if f == 0.0 { 0u64 } else { f.to_bits() });
            if seen.insert(key) {
                points.push(p);
            }
        }
    }
    points
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionHull {
    pub polygon: BoundaryPolygon,
    pub projection: PlaneProjection,
    pub area: f64,
}

/// Simplified convex outline of a region: the 2D hull of its vertices in the
/// region's best-fit plane, lifted back to 3D. Concavities are lost.
pub fn hull_region(mesh: &Mesh, region: &Region) -> Result<RegionHull, HullError> {
    let points = unique_region_points(mesh, region);
    if points.len() < 3 {
        return Err(HullError::TooFewVertices {
            region: region.id,
            count: points.len(),
        });
    }

    let projection = PlaneProjection::fit(&points)?;
    let projected: Vec<[f64; 2]> = points.iter().map(|p| projection.project(*p)).collect();
    let ring: Vec<[f64; 2]> = convex_hull(&projected)
        .into_iter()
        .map(|i| projected[i])
        .collect();
    let area = signed_area(&ring).abs();
    if ring.len() < 3 || area <= MIN_HULL_AREA {
        return Err(HullError::DegenerateHull {
            region: region.id,
            area,
        });
    }

    Ok(RegionHull {
        polygon: BoundaryPolygon {
            region_id: region.id,
            points: ring.iter().map(|uv| projection.lift(*uv)).collect(),
            vertex_indices: None,
        },
        projection,
        area,
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HullReport {
    pub polygons: Vec<BoundaryPolygon>,
    pub skipped: Vec<RegionFailure>,
}

/// Hulls every region; degenerate regions are skipped and recorded.
pub fn hull_regions(mesh: &Mesh, regions: &[Region]) -> HullReport {
    let mut report = HullReport::default();
    for region in regions {
        match hull_region(mesh, region) {
            Ok(hull) => report.polygons.push(hull.polygon),
            Err(err) => {
                debug!(region = region.id, %err, "skipping region");
                report.skipped.push(RegionFailure {
                    region_id: region.id,
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}
