use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::core::image::ClaheParams;
use crate::error::{PipelineError, PipelineResult};

pub const ENV_WORKSPACE: &str = "HEMO_WORKSPACE";
pub const ENV_OUTPUT_DIR: &str = "HEMO_OUTPUT_DIR";
pub const ENV_APPLY_CLAHE: &str = "HEMO_APPLY_CLAHE";
pub const ENV_WORKERS: &str = "HEMO_WORKERS";

/// One acquired source dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDataset {
    /// Identifier, also used as the output filename prefix
    pub id: String,
    /// Dataset root; defaults to `<workspace>/<id>`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl SourceDataset {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            path: None,
        }
    }
}

/// Run-wide pipeline configuration.
///
/// Loaded once before the pipeline starts and passed by reference afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workspace: PathBuf,
    pub sources: Vec<SourceDataset>,
    pub output_dir: PathBuf,
    pub apply_clahe: bool,
    pub clahe: ClaheParams,
    /// Manifest repeat count per class id; unlisted classes count once
    pub oversample: BTreeMap<u32, u32>,
    pub manifest_name: String,
    pub balanced_descriptor_name: String,
    /// Worker pool size; rayon's default when unset
    pub workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("Blood_Roboflow_Workspace_Remastered"),
            sources: vec![
                SourceDataset::new("BCCD"),
                SourceDataset::new("Raabin_WBC"),
                SourceDataset::new("Sickle_Cell"),
            ],
            output_dir: PathBuf::from("Final_Blood_YOLO_Hierarchical_Remastered_clahe"),
            apply_clahe: true,
            clahe: ClaheParams::default(),
            // RBC_Sickle and the five WBC subtypes
            oversample: BTreeMap::from([(1, 100), (4, 10), (5, 10), (6, 10), (7, 10), (8, 10)]),
            manifest_name: "train_balanced.txt".to_string(),
            balanced_descriptor_name: "data_balanced.yaml".to_string(),
            workers: None,
        }
    }
}

/// Absolute form of `path` for containment checks: `.` and `..` are folded
/// lexically and the longest existing ancestor is canonicalized.
fn resolved_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = fs::canonicalize(existing) {
            return missing.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return lexical,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl PipelineConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = serde_json::from_str::<PipelineConfig>(&contents).map_err(|e| {
                    PipelineError::Config(format!("Failed to parse {:?}: {}", path, e))
                })?;
                info!("Loaded configuration from {:?}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration file at {:?}. Using defaults.", path);
                Ok(Self::default())
            }
            Err(e) => Err(PipelineError::Config(format!(
                "Failed to read {:?}: {}",
                path, e
            ))),
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> PipelineResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> PipelineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workspace) = lookup(ENV_WORKSPACE) {
            self.workspace = PathBuf::from(workspace);
        }
        if let Some(output) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(output);
        }
        if let Some(raw) = lookup(ENV_APPLY_CLAHE) {
            self.apply_clahe = parse_flag(&raw).ok_or_else(|| {
                PipelineError::Config(format!("{} must be a boolean, got {:?}", ENV_APPLY_CLAHE, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_WORKERS) {
            let workers = raw.trim().parse::<usize>().map_err(|_| {
                PipelineError::Config(format!("{} must be a number, got {:?}", ENV_WORKERS, raw))
            })?;
            self.workers = Some(workers);
        }
        Ok(())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.sources.is_empty() {
            return Err(PipelineError::Config("no source datasets configured".to_string()));
        }

        let output = resolved_path(&self.output_dir);
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(PipelineError::Config("source dataset id is empty".to_string()));
            }
            if source.id.contains(['/', '\\']) {
                return Err(PipelineError::Config(format!(
                    "source dataset id {:?} contains a path separator",
                    source.id
                )));
            }
            let root = resolved_path(&self.source_root(source));
            if root.starts_with(&output) || output.starts_with(&root) {
                return Err(PipelineError::Config(format!(
                    "source dataset {:?} ({:?}) overlaps the output directory {:?}",
                    source.id, root, output
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "source dataset id {:?} is listed twice",
                    source.id
                )));
            }
        }
        // "A" + "B_x.png" and "A_B" + "x.png" would both become "A_B_x.png"
        for source in &self.sources {
            let prefix = format!("{}_", source.id);
            if let Some(other) = self.sources.iter().find(|o| o.id.starts_with(&prefix)) {
                return Err(PipelineError::Config(format!(
                    "source dataset ids {:?} and {:?} can produce colliding file names",
                    source.id, other.id
                )));
            }
        }

        if let Some((class_id, _)) = self.oversample.iter().find(|(_, &m)| m == 0) {
            return Err(PipelineError::Config(format!(
                "oversample multiplier for class {} must be at least 1",
                class_id
            )));
        }
        if !self.clahe.clip_limit.is_finite() || self.clahe.clip_limit <= 0.0 {
            return Err(PipelineError::Config(format!(
                "CLAHE clip limit must be positive, got {}",
                self.clahe.clip_limit
            )));
        }
        if self.clahe.tile_grid.0 == 0 || self.clahe.tile_grid.1 == 0 {
            return Err(PipelineError::Config("CLAHE tile grid must be at least 1x1".to_string()));
        }
        if self.workers == Some(0) {
            return Err(PipelineError::Config("workers must be at least 1".to_string()));
        }
        if self.manifest_name.trim().is_empty() || self.balanced_descriptor_name.trim().is_empty() {
            return Err(PipelineError::Config("output file names must not be empty".to_string()));
        }
        if self.manifest_name == self.balanced_descriptor_name {
            return Err(PipelineError::Config(
                "manifest and balanced descriptor names must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Root directory of a source dataset
    pub fn source_root(&self, source: &SourceDataset) -> PathBuf {
        source
            .path
            .clone()
            .unwrap_or_else(|| self.workspace.join(&source.id))
    }
}
