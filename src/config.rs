// SPDX-License-Identifier: GPL-3.0-only

use crate::constants::{DepthRange, depth_correction, projector};
use crate::errors::{Kinect3dError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mesh generation settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorConfig {
    /// Largest depth span a triangle may cover
    pub triangle_depth_range: f32,
    /// Temporal low-pass filtering of depth frames
    pub filter_depth_frames: bool,
    /// Spatial 3x3 low-pass on top of the temporal filter
    pub spatial_filter: bool,
    /// Weight of a new sample in the temporal filter
    pub temporal_alpha: f32,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            triangle_depth_range: projector::DEFAULT_TRIANGLE_DEPTH_RANGE,
            filter_depth_frames: false,
            spatial_filter: false,
            temporal_alpha: projector::DEFAULT_TEMPORAL_ALPHA,
        }
    }
}

impl ProjectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.triangle_depth_range.is_nan() || self.triangle_depth_range <= 0.0 {
            return Err(Kinect3dError::invalid_argument(format!(
                "triangle depth range {} must be positive",
                self.triangle_depth_range
            )));
        }
        if self.temporal_alpha.is_nan() || self.temporal_alpha <= 0.0 || self.temporal_alpha > 1.0
        {
            return Err(Kinect3dError::invalid_argument(format!(
                "temporal alpha {} must be in (0, 1]",
                self.temporal_alpha
            )));
        }
        Ok(())
    }

    /// Push these settings into a projector
    pub fn apply(&self, projector: &crate::projector::Projector) -> Result<()> {
        self.validate()?;
        projector.set_triangle_depth_range(self.triangle_depth_range)?;
        projector.set_temporal_alpha(self.temporal_alpha)?;
        projector.set_filter_depth_frames(self.filter_depth_frames, self.spatial_filter);
        Ok(())
    }
}

/// Replay settings for recorded streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSourceConfig {
    /// Pace frames by their time stamps instead of reading as fast as possible
    pub realtime: bool,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self { realtime: true }
    }
}

/// Which frame source to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SourceConfig {
    /// A locally attached camera, by enumeration index or serial number
    Direct {
        #[serde(default)]
        index: Option<usize>,
        #[serde(default)]
        serial: Option<String>,
    },
    /// A recorded depth and color stream pair
    File { depth: PathBuf, color: PathBuf },
    /// A remote server, as `host:port`
    Multiplexed { address: String },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Direct {
            index: Some(0),
            serial: None,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Direct {
                index: None,
                serial: None,
            } => Err(Kinect3dError::invalid_argument(
                "direct source needs an index or a serial number",
            )),
            SourceConfig::Direct {
                index: Some(_),
                serial: Some(_),
            } => Err(Kinect3dError::invalid_argument(
                "direct source takes either an index or a serial number",
            )),
            SourceConfig::Multiplexed { address } if !address.contains(':') => Err(
                Kinect3dError::invalid_argument(format!("address {} lacks a port", address)),
            ),
            _ => Ok(()),
        }
    }
}

/// Where calibration files live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub config_dir: PathBuf,
    /// Degree of newly fitted depth corrections
    pub depth_correction_degree: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            config_dir: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kinect3d"),
            depth_correction_degree: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub file_source: FileSourceConfig,
    pub projector: ProjectorConfig,
    pub calibration: CalibrationConfig,
    /// Valid raw depth interval reported to consumers
    pub depth_range: Option<DepthRange>,
}

impl Config {
    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Kinect3dError::NotFound(format!("configuration {}", path.display()))
            } else {
                Kinect3dError::from(e)
            }
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.projector.validate()?;
        if let Some(range) = self.depth_range {
            DepthRange::new(range.min, range.max)?;
        }
        if self.calibration.depth_correction_degree > depth_correction::MAX_DEGREE {
            return Err(Kinect3dError::invalid_argument(format!(
                "depth correction degree {} exceeds {}",
                self.calibration.depth_correction_degree,
                depth_correction::MAX_DEGREE
            )));
        }
        Ok(())
    }
}
