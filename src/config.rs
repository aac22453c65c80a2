use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::io::pairing::PairingOptions;
use crate::processing::process_batch::AlignmentSettings;
use crate::processing::procrustes::ProcrustesSettings;
use crate::processing::transform::TransformMode;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub landmark_dir: PathBuf,
    pub mesh_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub mode: TransformMode,
    pub suffix: String,
    pub template_name: String,
    pub mesh_extension: String,
    pub landmark_extension: String,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub parallel: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        let procrustes = ProcrustesSettings::default();
        SettingsConfig {
            mode: procrustes.mode,
            suffix: "_a".to_string(),
            template_name: "initial_template.vtk".to_string(),
            mesh_extension: "vtk".to_string(),
            landmark_extension: "mps".to_string(),
            max_iterations: procrustes.max_iterations,
            tolerance: procrustes.tolerance,
            parallel: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub write_mean_shape: bool,
    pub write_report: bool,
    pub mean_shape_file: String,
    pub report_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            write_mean_shape: true,
            write_report: true,
            mean_shape_file: "mean_shape.csv".to_string(),
            report_file: "alignment_report.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl AppConfig {
    /// Applies command-line overrides on top of the file values.
    pub fn with_overrides(
        mut self,
        mode: Option<TransformMode>,
        output_dir: Option<PathBuf>,
        parallel: bool,
    ) -> Self {
        if let Some(mode) = mode {
            self.settings.mode = mode;
        }
        if let Some(dir) = output_dir {
            self.general.output_dir = dir;
        }
        self.settings.parallel |= parallel;
        self
    }

    pub fn alignment_settings(&self) -> AlignmentSettings {
        AlignmentSettings {
            procrustes: ProcrustesSettings {
                mode: self.settings.mode,
                max_iterations: self.settings.max_iterations,
                tolerance: self.settings.tolerance,
            },
            suffix: self.settings.suffix.clone(),
            parallel: self.settings.parallel,
        }
    }

    pub fn pairing_options(&self) -> PairingOptions<'_> {
        PairingOptions {
            landmark_extension: &self.settings.landmark_extension,
            mesh_extension: &self.settings.mesh_extension,
            suffix: &self.settings.suffix,
            template_name: &self.settings.template_name,
        }
    }
}

pub fn parse_config(config_str: &str) -> anyhow::Result<AppConfig> {
    let config: AppConfig = toml::from_str(config_str)?;
    if config.settings.tolerance < 0.0 || !config.settings.tolerance.is_finite() {
        anyhow::bail!("tolerance must be a non-negative number");
    }
    Ok(config)
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    parse_config(&config_str).with_context(|| format!("Invalid config file {:?}", path))
}
