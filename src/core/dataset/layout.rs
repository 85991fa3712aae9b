use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

pub const IMAGES_DIR: &str = "images";
pub const LABELS_DIR: &str = "labels";
pub const LABEL_EXTENSION: &str = "txt";
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetSplit {
    Train,
    Valid,
    Test,
}

impl DatasetSplit {
    pub const ALL: [DatasetSplit; 3] = [DatasetSplit::Train, DatasetSplit::Valid, DatasetSplit::Test];

    /// Canonical directory name in the consolidated dataset
    pub fn as_str(&self) -> &str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Valid => "valid",
            DatasetSplit::Test => "test",
        }
    }

    /// Directory names accepted in source datasets, in lookup order
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            DatasetSplit::Train => &["train"],
            DatasetSplit::Valid => &["valid", "val", "validation"],
            DatasetSplit::Test => &["test"],
        }
    }

    /// Locate this split inside a source dataset root
    pub fn resolve_in(&self, dataset_root: &Path) -> Option<PathBuf> {
        self.aliases()
            .iter()
            .map(|alias| dataset_root.join(alias))
            .find(|candidate| candidate.is_dir())
    }
}

/// Output paths of one split inside the consolidated dataset
#[derive(Debug, Clone)]
pub struct SplitDirs {
    pub images: PathBuf,
    pub labels: PathBuf,
}

impl SplitDirs {
    pub fn new(root: &Path, split: DatasetSplit) -> Self {
        let base = root.join(split.as_str());
        Self {
            images: base.join(IMAGES_DIR),
            labels: base.join(LABELS_DIR),
        }
    }

    pub fn create(&self) -> PipelineResult<()> {
        for dir in [&self.images, &self.labels] {
            fs::create_dir_all(dir).map_err(|e| PipelineError::output(dir, e))?;
        }
        Ok(())
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(true)
}

/// List candidate image files of a source split's images area.
///
/// Directories and hidden entries are skipped; results are sorted by path.
pub fn list_split_images(images_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let entries = fs::read_dir(images_dir).map_err(|e| PipelineError::unreadable(images_dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::unreadable(images_dir, e))?;
        let path = entry.path();
        if path.is_dir() || is_hidden(&path) {
            debug!("Skipping entry {:?}", path);
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Image files directly inside `dir`, filtered by extension and sorted.
pub fn list_images_by_extension(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = list_split_images(dir)?
        .into_iter()
        .filter(|path| has_image_extension(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Label path for an image inside a consolidated split.
///
/// Replaces the last `images` component with `labels` and switches the
/// extension to `.txt`.
pub fn label_path_for_image(image_path: &Path) -> PipelineResult<PathBuf> {
    let components: Vec<Component> = image_path.components().collect();
    // The file name itself is not a candidate.
    let search_end = components.len().saturating_sub(1);
    let index = components[..search_end]
        .iter()
        .rposition(|c| c.as_os_str() == IMAGES_DIR)
        .ok_or_else(|| PipelineError::LayoutMismatch {
            path: image_path.to_path_buf(),
        })?;

    let mut label_path = PathBuf::new();
    for (i, component) in components.iter().enumerate() {
        if i == index {
            label_path.push(LABELS_DIR);
        } else {
            label_path.push(component.as_os_str());
        }
    }
    Ok(label_path.with_extension(LABEL_EXTENSION))
}
