//! Regular elevation grids from scattered points, and roof masks over them.
//!
//! A grid covers the square patch `[center - size/2, center + size/2]` on both
//! axes. Cell `(row, col)` holds samples with
//! `row = floor((y - (cy - size/2)) / spacing)` and
//! `col = floor((x - (cx - size/2)) / spacing)`, so row 0 is the lowest y.
//! The division is done on coordinates rounded to `precision` decimals and
//! scaled to integers, so large projected coordinates stay on the lattice.

use std::collections::HashMap;

use geo::{Area, BoundingRect, Intersects, Line, LineString, Point as GeoPoint, Polygon};
use mesh_io::{Point, PolygonMesh};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest accepted number of cells per axis.
pub const MAX_GRID_DIMENSION: usize = 10_000;

#[derive(Debug, Error, PartialEq)]
pub enum RasterError {
    #[error("invalid grid spec: {0}")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridSpec {
    pub center: [f64; 2],
    /// Side length of the square patch.
    pub size: f64,
    pub spacing: f64,
    /// Decimal places sample x/y are rounded to before deduplication.
    pub precision: u32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            center: [0.0, 0.0],
            size: 50.0,
            spacing: 0.5,
            precision: 2,
        }
    }
}

impl GridSpec {
    pub fn new(center: [f64; 2], size: f64, spacing: f64) -> Result<Self, RasterError> {
        let spec = Self {
            center,
            size,
            spacing,
            ..Self::default()
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), RasterError> {
        if !self.center.iter().all(|c| c.is_finite()) {
            return Err(RasterError::InvalidSpec("center must be finite".into()));
        }
        if !self.size.is_finite() || self.size <= 0.0 {
            return Err(RasterError::InvalidSpec(format!(
                "patch size {} must be positive",
                self.size
            )));
        }
        if !self.spacing.is_finite() || self.spacing <= 0.0 || self.spacing > self.size {
            return Err(RasterError::InvalidSpec(format!(
                "spacing {} must be positive and at most the patch size",
                self.spacing
            )));
        }
        if self.precision > 9 {
            return Err(RasterError::InvalidSpec(format!(
                "precision {} exceeds 9 decimals",
                self.precision
            )));
        }
        let steps = self.spacing * self.scale();
        if steps.round() < 1.0 || (steps - steps.round()).abs() > 1e-6 {
            return Err(RasterError::InvalidSpec(format!(
                "spacing {} is not a multiple of 1e-{}",
                self.spacing, self.precision
            )));
        }
        if self.size / self.spacing > MAX_GRID_DIMENSION as f64 {
            return Err(RasterError::InvalidSpec(format!(
                "{} / {} exceeds {MAX_GRID_DIMENSION} cells per axis",
                self.size, self.spacing
            )));
        }
        Ok(())
    }

    pub fn radius(&self) -> f64 {
        self.size / 2.0
    }

    /// Cells per axis, `floor(size / spacing)` in rounded units.
    pub fn dimension(&self) -> usize {
        let step = self.quantize(self.spacing);
        if step <= 0 {
            return 0;
        }
        (self.quantize(self.size) / step) as usize
    }

    /// Lower-left corner of the patch.
    pub fn origin(&self) -> [f64; 2] {
        [
            self.center[0] - self.radius(),
            self.center[1] - self.radius(),
        ]
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        (x - self.center[0]).abs() <= self.radius() && (y - self.center[1]).abs() <= self.radius()
    }

    /// `(row, col)` of the cell holding `(x, y)`, if inside the grid.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        self.cell_of_key(self.quantize(x), self.quantize(y))
    }

    fn cell_of_key(&self, kx: i64, ky: i64) -> Option<(usize, usize)> {
        let step = self.quantize(self.spacing);
        if step <= 0 {
            return None;
        }
        let [ox, oy] = self.origin();
        let row = (ky - self.quantize(oy)).div_euclid(step);
        let col = (kx - self.quantize(ox)).div_euclid(step);
        let dim = self.dimension() as i64;
        if row < 0 || col < 0 || row >= dim || col >= dim {
            return None;
        }
        Some((row as usize, col as usize))
    }

    fn scale(&self) -> f64 {
        10f64.powi(self.precision as i32)
    }

    fn quantize(&self, v: f64) -> i64 {
        (v * self.scale()).round() as i64
    }

    fn dequantize(&self, k: i64) -> f64 {
        k as f64 / self.scale()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElevationGrid {
    pub spec: GridSpec,
    pub rows: usize,
    pub cols: usize,
    /// Row-major, `NaN` where no sample landed.
    pub values: Vec<f64>,
}

impl ElevationGrid {
    pub fn empty(spec: GridSpec) -> Self {
        let dim = spec.dimension();
        Self {
            spec,
            rows: dim,
            cols: dim,
            values: vec![f64::NAN; dim * dim],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let v = self.values[row * self.cols + col];
        (!v.is_nan()).then_some(v)
    }

    pub fn data_cells(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        if self.cols == 0 {
            return Vec::new();
        }
        self.values.chunks(self.cols).map(<[f64]>::to_vec).collect()
    }
}

/// A deduplicated sample at its rounded x/y coordinate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GridSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Distinct sorted x and y values present among the samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GridAxes {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub grid: ElevationGrid,
    pub samples: Vec<GridSample>,
    pub axes: GridAxes,
}

/// Samples scattered points onto the regular grid described by `spec`.
///
/// Points outside the patch are ignored. Points whose rounded x/y collide
/// overwrite each other, the last one wins. An empty result is an all-`NaN`
/// grid, not an error.
pub fn rasterize(points: &[Point], spec: &GridSpec) -> Result<Raster, RasterError> {
    spec.validate()?;

    let mut slots: HashMap<(i64, i64), usize> = HashMap::new();
    let mut keyed: Vec<((i64, i64), f64)> = Vec::new();
    for p in points.iter().filter(|p| spec.contains(p[0], p[1])) {
        let key = (spec.quantize(p[0]), spec.quantize(p[1]));
        match slots.get(&key) {
            Some(&slot) => keyed[slot].1 = p[2],
            None => {
                slots.insert(key, keyed.len());
                keyed.push((key, p[2]));
            }
        }
    }

    let mut grid = ElevationGrid::empty(*spec);
    let mut samples = Vec::with_capacity(keyed.len());
    let mut outside = 0usize;
    for &((kx, ky), z) in &keyed {
        let sample = GridSample {
            x: spec.dequantize(kx),
            y: spec.dequantize(ky),
            z,
        };
        match spec.cell_of_key(kx, ky) {
            Some((row, col)) => grid.values[row * grid.cols + col] = z,
            None => outside += 1,
        }
        samples.push(sample);
    }

    if samples.is_empty() {
        warn!(
            center = ?spec.center,
            size = spec.size,
            "no samples inside patch, grid is empty"
        );
    } else {
        debug!(
            samples = samples.len(),
            on_edge = outside,
            filled = grid.data_cells(),
            "rasterized patch"
        );
    }

    let axes = GridAxes {
        xs: sorted_axis(keyed.iter().map(|((kx, _), _)| *kx), spec),
        ys: sorted_axis(keyed.iter().map(|((_, ky), _)| *ky), spec),
    };
    Ok(Raster {
        grid,
        samples,
        axes,
    })
}

fn sorted_axis(keys: impl Iterator<Item = i64>, spec: &GridSpec) -> Vec<f64> {
    let mut keys: Vec<i64> = keys.collect();
    keys.sort_unstable();
    keys.dedup();
    keys.into_iter().map(|k| spec.dequantize(k)).collect()
}

// --- Masking -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskGrid {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<bool>,
}

impl MaskGrid {
    pub fn get(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols && self.cells[row * self.cols + col]
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }
}

/// Marks the cells of `grid` whose axis coordinates fall inside (or on the
/// boundary of) any of `polygons`, given as x–y rings without closing
/// duplicate.
pub fn compute_mask(
    grid: &ElevationGrid,
    axes: &GridAxes,
    polygons: &[Vec<[f64; 2]>],
) -> MaskGrid {
    let mut mask = MaskGrid {
        rows: grid.rows,
        cols: grid.cols,
        cells: vec![false; grid.rows * grid.cols],
    };

    for (idx, ring) in polygons.iter().enumerate() {
        if ring.len() < 3 {
            debug!(polygon = idx, "skipping polygon with fewer than 3 points");
            continue;
        }
        let polygon = Polygon::new(
            LineString::from(ring.iter().map(|p| (p[0], p[1])).collect::<Vec<_>>()),
            vec![],
        );
        if polygon.unsigned_area() <= 0.0 {
            debug!(polygon = idx, "skipping zero-area polygon");
            continue;
        }
        if !is_simple_ring(ring) {
            debug!(polygon = idx, "skipping self-intersecting polygon");
            continue;
        }
        let Some(bounds) = polygon.bounding_rect() else {
            continue;
        };

        let xs = axis_range(&axes.xs, bounds.min().x, bounds.max().x);
        let ys = axis_range(&axes.ys, bounds.min().y, bounds.max().y);
        for &y in ys {
            for &x in xs {
                if !polygon.intersects(&GeoPoint::new(x, y)) {
                    continue;
                }
                if let Some((row, col)) = grid.spec.cell_of(x, y) {
                    mask.cells[row * mask.cols + col] = true;
                }
            }
        }
    }

    mask
}

/// True when no two non-neighbouring edges of the closed ring touch.
fn is_simple_ring(ring: &[[f64; 2]]) -> bool {
    let n = ring.len();
    let edge = |i: usize| {
        let (a, b) = (ring[i], ring[(i + 1) % n]);
        Line::new((a[0], a[1]), (b[0], b[1]))
    };
    for i in 0..n {
        for j in i + 2..n {
            if i == 0 && j == n - 1 {
                continue;
            }
            if edge(i).intersects(&edge(j)) {
                return false;
            }
        }
    }
    true
}

fn axis_range(axis: &[f64], min: f64, max: f64) -> &[f64] {
    let lo = axis.partition_point(|&v| v < min);
    let hi = axis.partition_point(|&v| v <= max);
    &axis[lo..hi.max(lo)]
}

// --- Surface mesh --------------------------------------------------------

/// Quad mesh over the sample lattice. A quad is emitted where all four
/// corners have a sample and every corner lies above `min_z`.
pub fn surface_mesh(raster: &Raster, min_z: f64) -> PolygonMesh {
    let cols = raster.axes.xs.len();
    let rows = raster.axes.ys.len();
    let mut mesh = PolygonMesh::default();
    if rows < 2 || cols < 2 {
        return mesh;
    }

    let x_index = axis_index(&raster.axes.xs);
    let y_index = axis_index(&raster.axes.ys);
    let mut lattice: Vec<Option<u32>> = vec![None; rows * cols];
    for sample in &raster.samples {
        let (Some(&j), Some(&i)) = (
            x_index.get(&sample.x.to_bits()),
            y_index.get(&sample.y.to_bits()),
        ) else {
            continue;
        };
        lattice[i * cols + j] = Some(mesh.vertices.len() as u32);
        mesh.vertices.push([sample.x, sample.y, sample.z]);
    }

    for i in 0..rows - 1 {
        for j in 0..cols - 1 {
            let corners = [
                lattice[i * cols + j],
                lattice[i * cols + j + 1],
                lattice[(i + 1) * cols + j + 1],
                lattice[(i + 1) * cols + j],
            ];
            let Some(quad) = corners.into_iter().collect::<Option<Vec<u32>>>() else {
                continue;
            };
            if quad.iter().all(|&v| mesh.vertices[v as usize][2] > min_z) {
                mesh.faces.push(quad);
            }
        }
    }

    mesh
}

fn axis_index(axis: &[f64]) -> HashMap<u64, usize> {
    axis.iter().enumerate().map(|(i, v)| (v.to_bits(), i)).collect()
}

// --- Footprint -----------------------------------------------------------

/// Whole-unit x–y bounding box of a building, floored and ceiled outward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Footprint {
    pub min_x: i64,
    pub min_y: i64,
    pub max_x: i64,
    pub max_y: i64,
}

impl Footprint {
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut lo, mut hi) = ([first[0], first[1]], [first[0], first[1]]);
        for p in points {
            lo = [lo[0].min(p[0]), lo[1].min(p[1])];
            hi = [hi[0].max(p[0]), hi[1].max(p[1])];
        }
        Some(Self {
            min_x: lo[0].floor() as i64,
            min_y: lo[1].floor() as i64,
            max_x: hi[0].ceil() as i64,
            max_y: hi[1].ceil() as i64,
        })
    }

    pub fn center(&self) -> [f64; 2] {
        [
            (self.min_x + self.max_x) as f64 / 2.0,
            (self.min_y + self.max_y) as f64 / 2.0,
        ]
    }

    pub fn extent(&self) -> [i64; 2] {
        [self.max_x - self.min_x, self.max_y - self.min_y]
    }

    /// True when both extents lie within `[min_size, max_size]`.
    pub fn within_size(&self, min_size: f64, max_size: f64) -> bool {
        self.extent()
            .iter()
            .all(|&e| (min_size..=max_size).contains(&(e as f64)))
    }

    /// `{min_x}_{min_y}_{max_x}_{max_y}`, the usual sample name.
    pub fn label(&self) -> String {
        format!("{}_{}_{}_{}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}
