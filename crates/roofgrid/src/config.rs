use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use planar::ClusterConfig;
use raster::{GridSpec, RasterError};
use serde::{Deserialize, Serialize};

/// Settings shared by all subcommands. Loaded from a JSON file, any field may
/// be omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub cluster: ClusterConfig,
    pub grid: GridConfig,
    pub building: BuildingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    pub size: f64,
    pub spacing: f64,
    pub precision: u32,
    /// Surface quads with a corner at or below this height are left out.
    pub min_z: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        let spec = GridSpec::default();
        Self {
            size: spec.size,
            spacing: spec.spacing,
            precision: spec.precision,
            min_z: 0.0,
        }
    }
}

impl GridConfig {
    pub fn spec(&self, center: [f64; 2]) -> Result<GridSpec, RasterError> {
        let spec = GridSpec {
            center,
            size: self.size,
            spacing: self.spacing,
            precision: self.precision,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Buildings whose footprint extent falls outside this range are skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildingConfig {
    pub min_size: f64,
    pub max_size: f64,
}

impl Default for BuildingConfig {
    fn default() -> Self {
        Self {
            min_size: 4.0,
            max_size: 40.0,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"grid": {{"spacing": 1.0}}, "cluster": {{"min_area": 2.5}}}}"#).unwrap();
        let config = PipelineConfig::load(file.path()).expect("config loads");
        assert_eq!(config.grid.spacing, 1.0);
        assert_eq!(config.grid.size, 50.0);
        assert_eq!(config.cluster.min_area, 2.5);
        assert_eq!(
            config.cluster.angle_tolerance_rad,
            ClusterConfig::default().angle_tolerance_rad
        );
        assert_eq!(config.building, BuildingConfig::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config"));
    }

    #[test]
    fn grid_config_validates_spec() {
        let grid = GridConfig {
            spacing: 0.0,
            ..GridConfig::default()
        };
        assert!(grid.spec([0.0, 0.0]).is_err());
        let spec = GridConfig::default().spec([1.0, 2.0]).expect("spec");
        assert_eq!(spec.dimension(), 100);
    }
}
