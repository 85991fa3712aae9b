//! `data.yaml` descriptors: reading source class declarations and writing the
//! consolidated and balanced descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::layout::{DatasetSplit, IMAGES_DIR};
use crate::core::taxonomy::taxonomy_names;
use crate::error::{PipelineError, PipelineResult};

pub const DESCRIPTOR_FILE: &str = "data.yaml";

/// Upper bound on class indices accepted from an index-map `names` entry
const MAX_CLASS_INDEX: usize = 65_536;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassNames {
    Sequence(Vec<String>),
    Mapping(BTreeMap<usize, String>),
}

#[derive(Debug, Deserialize)]
struct SourceDescriptor {
    #[serde(default)]
    names: Option<ClassNames>,
}

fn parse_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> PipelineResult<T> {
    let data = fs::read_to_string(path).map_err(|e| PipelineError::unreadable(path, e))?;
    serde_yaml::from_str(&data).map_err(|source| PipelineError::Descriptor {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the ordered class names declared by a source dataset.
pub fn read_class_names(path: &Path) -> PipelineResult<Vec<String>> {
    let descriptor: SourceDescriptor = parse_yaml(path)?;

    let names = match descriptor.names {
        Some(ClassNames::Sequence(names)) => names,
        Some(ClassNames::Mapping(mapping)) => {
            if let Some(&index) = mapping.keys().find(|&&k| k >= MAX_CLASS_INDEX) {
                return Err(PipelineError::Config(format!(
                    "{:?} declares class index {} (limit {})",
                    path, index, MAX_CLASS_INDEX
                )));
            }
            let len = mapping.keys().next_back().map(|max| max + 1).unwrap_or(0);
            let mut names = vec![String::new(); len];
            for (index, name) in mapping {
                names[index] = name;
            }
            names
        }
        None => {
            return Err(PipelineError::Config(format!(
                "{:?} declares no class names",
                path
            )))
        }
    };
    Ok(names)
}

/// Descriptor of the consolidated dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedDescriptor {
    pub path: PathBuf,
    pub train: String,
    pub val: String,
    pub test: String,
    pub nc: usize,
    pub names: Vec<String>,
}

impl UnifiedDescriptor {
    pub fn for_root(root: &Path) -> Self {
        let images = |split: DatasetSplit| format!("{}/{}", split.as_str(), IMAGES_DIR);
        let names = taxonomy_names();
        Self {
            path: root.to_path_buf(),
            train: images(DatasetSplit::Train),
            val: images(DatasetSplit::Valid),
            test: images(DatasetSplit::Test),
            nc: names.len(),
            names,
        }
    }

    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        let yaml = serde_yaml::to_string(self).map_err(|source| PipelineError::Descriptor {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, yaml).map_err(|e| PipelineError::output(path, e))
    }
}

/// Training image source declared by a descriptor's `train` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainSource {
    Directory(PathBuf),
    Manifest(PathBuf),
}

/// A descriptor loaded generically so unrelated keys survive a rewrite
#[derive(Debug, Clone)]
pub struct DescriptorDocument {
    path: PathBuf,
    value: serde_yaml::Mapping,
}

impl DescriptorDocument {
    /// Load a descriptor. The stored path is canonical, so everything resolved
    /// from it (and every manifest entry built from those) is absolute.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let value: serde_yaml::Mapping = parse_yaml(path)?;
        let path = fs::canonicalize(path).map_err(|e| PipelineError::unreadable(path, e))?;
        Ok(Self { path, value })
    }

    /// Directory that relative entries are resolved against
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn train_entry(&self) -> PipelineResult<String> {
        match self.value.get("train") {
            Some(serde_yaml::Value::String(train)) => Ok(train.clone()),
            _ => Err(PipelineError::Config(format!(
                "{:?} has no string 'train' entry",
                self.path
            ))),
        }
    }

    pub fn train_source(&self) -> PipelineResult<TrainSource> {
        let entry = self.train_entry()?;
        let resolved = self.base_dir().join(&entry);
        if entry.ends_with(".txt") {
            Ok(TrainSource::Manifest(resolved))
        } else {
            Ok(TrainSource::Directory(resolved))
        }
    }

    /// Copy of this descriptor whose `train` entry points at `manifest_name`
    pub fn with_train(&self, manifest_name: &str) -> Self {
        let mut value = self.value.clone();
        value.insert(
            serde_yaml::Value::String("train".to_string()),
            serde_yaml::Value::String(manifest_name.to_string()),
        );
        Self {
            path: self.path.clone(),
            value,
        }
    }

    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        let yaml = serde_yaml::to_string(&self.value).map_err(|source| {
            PipelineError::Descriptor {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, yaml).map_err(|e| PipelineError::output(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_sequence_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DESCRIPTOR_FILE);
        fs::write(&path, "nc: 3\nnames: ['Platelets', 'RBC', 'WBC']\n").unwrap();
        assert_eq!(read_class_names(&path).unwrap(), vec!["Platelets", "RBC", "WBC"]);
    }

    #[test]
    fn test_read_mapping_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DESCRIPTOR_FILE);
        fs::write(&path, "names:\n  0: sickle\n  2: normal\n").unwrap();
        assert_eq!(read_class_names(&path).unwrap(), vec!["sickle", "", "normal"]);
    }

    #[test]
    fn test_sparse_mapping_index_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DESCRIPTOR_FILE);
        fs::write(&path, "names:\n  0: RBC\n  4000000000: WBC\n").unwrap();
        assert!(matches!(read_class_names(&path), Err(PipelineError::Config(_))));

        fs::write(&path, "names:\n  65535: RBC\n").unwrap();
        assert_eq!(read_class_names(&path).unwrap().len(), 65_536);
    }

    #[test]
    fn test_malformed_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DESCRIPTOR_FILE);
        fs::write(&path, "names: [unclosed\n").unwrap();
        assert!(matches!(
            read_class_names(&path),
            Err(PipelineError::Descriptor { .. })
        ));

        fs::write(&path, "nc: 2\n").unwrap();
        assert!(matches!(read_class_names(&path), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_unified_descriptor_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DESCRIPTOR_FILE);
        let descriptor = UnifiedDescriptor::for_root(tmp.path());
        descriptor.write(&path).unwrap();

        let loaded: UnifiedDescriptor = parse_yaml(&path).unwrap();
        assert_eq!(loaded, descriptor);
        assert_eq!(loaded.nc, 9);
        assert_eq!(loaded.val, "valid/images");
    }

    #[test]
    fn test_train_source_and_rewrite() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let path = root.join(DESCRIPTOR_FILE);
        fs::write(&path, "train: train/images\nval: valid/images\nnc: 9\n").unwrap();

        let doc = DescriptorDocument::load(&path).unwrap();
        assert_eq!(
            doc.train_source().unwrap(),
            TrainSource::Directory(root.join("train/images"))
        );

        let balanced = doc.with_train("train_balanced.txt");
        let out = root.join("data_balanced.yaml");
        balanced.write(&out).unwrap();

        let reloaded = DescriptorDocument::load(&out).unwrap();
        assert_eq!(
            reloaded.train_source().unwrap(),
            TrainSource::Manifest(root.join("train_balanced.txt"))
        );
        assert_eq!(
            reloaded.value.get("val"),
            Some(&serde_yaml::Value::String("valid/images".to_string()))
        );
    }
}
