mod config;
mod pipeline;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use geom_core::{validate_mesh, weld_vertices, WeldReport};
use mesh_io::{load_mesh, load_xyz, write_grid_csv, write_mask_csv, write_obj, LoadedMesh, Point};
use planar::ClusterConfig;
use raster::{compute_mask, rasterize, surface_mesh, Footprint, Raster};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{BuildingConfig, GridConfig, PipelineConfig};
use crate::pipeline::{polygon_mesh, reconstruct_roof, Reconstruction, Strategy};

#[derive(Parser, Debug)]
#[command(
    name = "roofgrid",
    author,
    version,
    about = "Reconstruct roof outlines and rasterize their surroundings"
)]
struct Cli {
    /// Repeat for more log output (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON file with cluster, grid and building settings.
    #[arg(long, value_name = "JSON", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Turn roof meshes into planar outline polygons.
    Roof(RoofArgs),
    /// Rasterize scattered points into an elevation grid.
    Grid(GridArgs),
    /// Produce one training sample: roof polygons, grid and mask.
    Sample(SampleArgs),
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
struct ClusterOverrides {
    #[arg(long = "angle-tol-deg", value_name = "DEG")]
    angle_tol_deg: Option<f64>,

    #[arg(long = "min-area")]
    min_area: Option<f64>,
}

impl ClusterOverrides {
    fn apply(&self, mut base: ClusterConfig) -> Result<ClusterConfig> {
        if let Some(deg) = self.angle_tol_deg {
            base.angle_tolerance_rad = deg.to_radians();
        }
        if let Some(area) = self.min_area {
            base.min_area = area;
        }
        base.validate()?;
        Ok(base)
    }
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
struct GridOverrides {
    /// Side length of the square patch.
    #[arg(long)]
    size: Option<f64>,

    #[arg(long)]
    spacing: Option<f64>,

    /// Surface quads touching a point at or below this height are dropped.
    #[arg(long = "min-z", allow_hyphen_values = true)]
    min_z: Option<f64>,
}

impl GridOverrides {
    fn apply(&self, mut base: GridConfig) -> GridConfig {
        if let Some(size) = self.size {
            base.size = size;
        }
        if let Some(spacing) = self.spacing {
            base.spacing = spacing;
        }
        if let Some(min_z) = self.min_z {
            base.min_z = min_z;
        }
        base
    }
}

#[derive(Args, Debug)]
struct RoofArgs {
    #[arg(required = true, value_name = "INPUT.obj")]
    inputs: Vec<PathBuf>,

    /// Where `<stem>_poly.obj` files go; defaults to beside each input.
    #[arg(long = "out-dir")]
    out_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "exact")]
    strategy: Strategy,

    /// Use the projected hull for regions the exact merge rejects.
    #[arg(long = "fallback-hull")]
    fallback_hull: bool,

    #[command(flatten)]
    cluster: ClusterOverrides,

    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GridArgs {
    #[arg(required = true, value_name = "POINTS.xyz")]
    points: Vec<PathBuf>,

    #[arg(long = "center-x", allow_hyphen_values = true)]
    center_x: f64,

    #[arg(long = "center-y", allow_hyphen_values = true)]
    center_y: f64,

    #[command(flatten)]
    grid: GridOverrides,

    #[arg(short, long, value_name = "CSV")]
    output: PathBuf,

    /// Also write the sample lattice as a quad mesh.
    #[arg(long, value_name = "OBJ")]
    surface: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SampleArgs {
    #[arg(long)]
    roof: PathBuf,

    #[arg(long, required = true, num_args = 1.., value_name = "POINTS.xyz")]
    points: Vec<PathBuf>,

    #[arg(long = "out-dir")]
    out_dir: PathBuf,

    #[arg(long, value_enum, default_value = "exact")]
    strategy: Strategy,

    #[arg(long = "fallback-hull")]
    fallback_hull: bool,

    #[command(flatten)]
    cluster: ClusterOverrides,

    #[command(flatten)]
    grid: GridOverrides,

    #[arg(long = "min-size")]
    min_size: Option<f64>,

    #[arg(long = "max-size")]
    max_size: Option<f64>,
}

impl SampleArgs {
    fn building(&self, mut base: BuildingConfig) -> BuildingConfig {
        if let Some(min) = self.min_size {
            base.min_size = min;
        }
        if let Some(max) = self.max_size {
            base.max_size = max;
        }
        base
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;

    match &cli.command {
        Command::Roof(args) => {
            let entries = run_roof(args, &config)?;
            let polygons: usize = entries.iter().map(|e| e.polygons).sum();
            println!(
                "Reconstructed {} roof(s) into {} polygon(s)",
                entries.len(),
                polygons
            );
        }
        Command::Grid(args) => {
            let summary = run_grid(args, &config)?;
            println!(
                "Wrote {}x{} grid with {} filled cell(s) to {}",
                summary.rows,
                summary.cols,
                summary.data_cells,
                args.output.display()
            );
        }
        Command::Sample(args) => {
            let report = run_sample(args, &config)?;
            match &report.skipped {
                Some(reason) => println!("Skipped {}: {}", report.label, reason),
                None => println!(
                    "Wrote sample {} ({} masked cell(s)) to {}",
                    report.label,
                    report.masked_cells,
                    args.out_dir.display()
                ),
            }
        }
    }
    Ok(())
}

/// Library crates log through `tracing`; with no subscriber installed its
/// `log` bridge forwards events to `env_logger`. `RUST_LOG` wins over `-v`.
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .target(env_logger::Target::Stderr)
        .try_init();
}

// --- roof ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RoofEntry {
    input: PathBuf,
    output: Option<PathBuf>,
    polygons: usize,
    dropped_input_faces: usize,
    welded_vertices: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    reconstruction: Option<Reconstruction>,
}

fn run_roof(args: &RoofArgs, config: &PipelineConfig) -> Result<Vec<RoofEntry>> {
    let cluster = args.cluster.apply(config.cluster)?;
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let entries: Vec<RoofEntry> = args
        .inputs
        .par_iter()
        .map(|input| {
            let output = roof_output_path(input, args.out_dir.as_deref());
            match process_roof(input, &output, &cluster, args.strategy, args.fallback_hull) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(input = %input.display(), "{err:#}");
                    RoofEntry {
                        input: input.clone(),
                        output: None,
                        polygons: 0,
                        dropped_input_faces: 0,
                        welded_vertices: 0,
                        error: Some(format!("{err:#}")),
                        reconstruction: None,
                    }
                }
            }
        })
        .collect();

    if let Some(path) = &args.report {
        write_report(path, &entries)?;
    }
    let failed = entries.iter().filter(|e| e.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} of {} roof input(s) failed", entries.len());
    }
    Ok(entries)
}

fn process_roof(
    input: &Path,
    output: &Path,
    cluster: &ClusterConfig,
    strategy: Strategy,
    fallback_hull: bool,
) -> Result<RoofEntry> {
    let (mesh, dropped, weld) = load_roof(input)?;
    let reconstruction = reconstruct_roof(&mesh, cluster, strategy, fallback_hull)?;
    write_obj(output, &polygon_mesh(&mesh, &reconstruction.polygons))
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        input = %input.display(),
        polygons = reconstruction.polygon_count(),
        "wrote roof polygons"
    );
    Ok(RoofEntry {
        input: input.to_path_buf(),
        output: Some(output.to_path_buf()),
        polygons: reconstruction.polygon_count(),
        dropped_input_faces: dropped,
        welded_vertices: weld.merged_vertices,
        error: None,
        reconstruction: Some(reconstruction),
    })
}

/// Loads a roof mesh and welds coincident vertices so shared edges line up.
fn load_roof(path: &Path) -> Result<(mesh_io::Mesh, usize, WeldReport)> {
    let LoadedMesh {
        mut mesh, report, ..
    } = load_mesh(path).with_context(|| format!("loading {}", path.display()))?;
    let weld = weld_vertices(&mut mesh);
    validate_mesh(&mesh).with_context(|| format!("checking {}", path.display()))?;
    Ok((mesh, report.dropped_faces + weld.dropped_faces, weld))
}

fn roof_output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("roof");
    let name = format!("{stem}_poly.obj");
    match out_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

// --- grid ----------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
struct GridSummary {
    center: [f64; 2],
    size: f64,
    spacing: f64,
    rows: usize,
    cols: usize,
    samples: usize,
    data_cells: usize,
}

impl GridSummary {
    fn of(raster: &Raster) -> Self {
        let spec = raster.grid.spec;
        Self {
            center: spec.center,
            size: spec.size,
            spacing: spec.spacing,
            rows: raster.grid.rows,
            cols: raster.grid.cols,
            samples: raster.samples.len(),
            data_cells: raster.grid.data_cells(),
        }
    }
}

fn run_grid(args: &GridArgs, config: &PipelineConfig) -> Result<GridSummary> {
    let grid = args.grid.apply(config.grid);
    let spec = grid.spec([args.center_x, args.center_y])?;
    let points = load_points(&args.points)?;
    let raster = rasterize(&points, &spec)?;

    write_grid_csv(&args.output, raster.grid.cols, &raster.grid.values)
        .with_context(|| format!("writing {}", args.output.display()))?;
    if let Some(path) = &args.surface {
        write_obj(path, &surface_mesh(&raster, grid.min_z))
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(GridSummary::of(&raster))
}

fn load_points(paths: &[PathBuf]) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for path in paths {
        let chunk = load_xyz(path).with_context(|| format!("loading {}", path.display()))?;
        info!(path = %path.display(), points = chunk.len(), "loaded point cloud");
        points.extend(chunk);
    }
    Ok(points)
}

// --- sample --------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SampleReport {
    label: String,
    footprint: Footprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<String>,
    welded_vertices: usize,
    dropped_input_faces: usize,
    roof: Option<Reconstruction>,
    grid: Option<GridSummary>,
    masked_cells: usize,
}

fn run_sample(args: &SampleArgs, config: &PipelineConfig) -> Result<SampleReport> {
    let cluster = args.cluster.apply(config.cluster)?;
    let grid = args.grid.apply(config.grid);
    let building = args.building(config.building);

    let (mesh, dropped, weld) = load_roof(&args.roof)?;
    let footprint = Footprint::from_points(&mesh.vertices)
        .with_context(|| format!("{} has no vertices", args.roof.display()))?;
    let mut report = SampleReport {
        label: footprint.label(),
        footprint,
        skipped: None,
        welded_vertices: weld.merged_vertices,
        dropped_input_faces: dropped,
        roof: None,
        grid: None,
        masked_cells: 0,
    };
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("creating {}", args.out_dir.display()))?;
    let report_path = args.out_dir.join("report.json");

    if !footprint.within_size(building.min_size, building.max_size) {
        let [w, h] = footprint.extent();
        report.skipped = Some(format!(
            "footprint {w}x{h} outside [{}, {}]",
            building.min_size, building.max_size
        ));
        write_report(&report_path, &report)?;
        return Ok(report);
    }

    let reconstruction = reconstruct_roof(&mesh, &cluster, args.strategy, args.fallback_hull)?;
    if reconstruction.polygons.is_empty() {
        report.skipped = Some("no usable roof polygons".into());
        report.roof = Some(reconstruction);
        write_report(&report_path, &report)?;
        return Ok(report);
    }

    let points = load_points(&args.points)?;
    let spec = grid.spec(footprint.center())?;
    let raster = rasterize(&points, &spec)?;
    let mask = compute_mask(&raster.grid, &raster.axes, &reconstruction.footprints());

    let out = &args.out_dir;
    write_obj(out.join("roof.obj"), &polygon_mesh(&mesh, &reconstruction.polygons))?;
    write_grid_csv(
        out.join("surroundings2D.csv"),
        raster.grid.cols,
        &raster.grid.values,
    )?;
    write_obj(out.join("surroundings3D.obj"), &surface_mesh(&raster, grid.min_z))?;
    write_mask_csv(out.join("mask.csv"), mask.cols, &mask.cells)?;

    report.masked_cells = mask.count();
    report.grid = Some(GridSummary::of(&raster));
    report.roof = Some(reconstruction);
    write_report(&report_path, &report)?;
    info!(label = %report.label, masked = report.masked_cells, "wrote sample");
    Ok(report)
}

fn write_report<T: Serialize + ?Sized>(path: &Path, report: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
