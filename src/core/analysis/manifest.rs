use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::ClassFrequencyStats;
use crate::core::dataset::{
    label_path_for_image, leading_class_id, list_images_by_extension, DescriptorDocument,
    TrainSource,
};
use crate::error::{PipelineError, PipelineResult};

/// What a single training image contributes to the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
enum ImageVerdict {
    /// Path does not follow the images/labels layout
    Skipped,
    /// No label file: kept once
    Background,
    Labeled {
        repeats: u32,
        class_ids: Vec<u32>,
        malformed: usize,
    },
}

/// Result of a balancing pass
#[derive(Debug, Clone, Default)]
pub struct BalanceReport {
    pub manifest: Vec<PathBuf>,
    pub source_images: usize,
    pub background_images: usize,
    /// Images repeated more than once
    pub boosted_images: usize,
    pub skipped_layout: usize,
    /// Images whose label file exists but could not be read
    pub unreadable_labels: usize,
    pub malformed_lines: usize,
    pub class_counts: ClassFrequencyStats,
}

impl BalanceReport {
    pub fn manifest_entries(&self) -> usize {
        self.manifest.len()
    }

    /// Manifest file contents, one path per line
    pub fn render(&self) -> String {
        self.manifest
            .iter()
            .map(|path| format!("{}\n", path.display()))
            .collect()
    }
}

/// Builds an oversampled training manifest over a consolidated dataset.
pub struct ManifestBalancer<'a> {
    oversample: &'a BTreeMap<u32, u32>,
}

impl<'a> ManifestBalancer<'a> {
    pub fn new(oversample: &'a BTreeMap<u32, u32>) -> Self {
        Self { oversample }
    }

    fn multiplier(&self, class_id: u32) -> u32 {
        self.oversample.get(&class_id).copied().unwrap_or(1)
    }

    /// Resolve the training images declared by a descriptor, in iteration order.
    pub fn training_images(&self, descriptor: &DescriptorDocument) -> PipelineResult<Vec<PathBuf>> {
        match descriptor.train_source()? {
            TrainSource::Directory(dir) => list_images_by_extension(&dir),
            TrainSource::Manifest(path) => read_manifest(&path, &descriptor.base_dir()),
        }
    }

    fn inspect(&self, image_path: &Path) -> PipelineResult<ImageVerdict> {
        let label_path = match label_path_for_image(image_path) {
            Ok(path) => path,
            Err(e) => {
                warn!("{}, skipping", e);
                return Ok(ImageVerdict::Skipped);
            }
        };
        if !label_path.is_file() {
            return Ok(ImageVerdict::Background);
        }

        let content =
            fs::read_to_string(&label_path).map_err(|e| PipelineError::unreadable(&label_path, e))?;
        let mut class_ids = Vec::new();
        let mut malformed = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match leading_class_id(line) {
                Some(class_id) => class_ids.push(class_id),
                None => {
                    warn!("Malformed line in {:?}: {:?}", label_path, line);
                    malformed += 1;
                }
            }
        }

        // Highest multiplier among the classes present; never summed.
        let repeats = class_ids
            .iter()
            .map(|&id| self.multiplier(id))
            .max()
            .unwrap_or(1);

        Ok(ImageVerdict::Labeled {
            repeats,
            class_ids,
            malformed,
        })
    }

    /// Build the manifest for `images`, preserving their order.
    pub fn balance_images(&self, images: &[PathBuf]) -> BalanceReport {
        let verdicts: Vec<PipelineResult<ImageVerdict>> =
            images.par_iter().map(|path| self.inspect(path)).collect();

        let mut report = BalanceReport {
            source_images: images.len(),
            ..Default::default()
        };

        for (path, verdict) in images.iter().zip(verdicts) {
            match verdict {
                Ok(ImageVerdict::Skipped) => report.skipped_layout += 1,
                Ok(ImageVerdict::Background) => {
                    report.background_images += 1;
                    report.manifest.push(path.clone());
                }
                Ok(ImageVerdict::Labeled {
                    repeats,
                    class_ids,
                    malformed,
                }) => {
                    for class_id in class_ids {
                        report.class_counts.record(class_id);
                    }
                    report.malformed_lines += malformed;
                    if repeats > 1 {
                        report.boosted_images += 1;
                    }
                    for _ in 0..repeats {
                        report.manifest.push(path.clone());
                    }
                }
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    report.unreadable_labels += 1;
                }
            }
        }

        report
    }

    /// Balance the training split declared in `descriptor_path` and write the
    /// manifest plus a descriptor pointing at it next to the original.
    pub fn run(
        &self,
        descriptor_path: &Path,
        manifest_name: &str,
        balanced_descriptor_name: &str,
    ) -> PipelineResult<BalanceReport> {
        let descriptor = DescriptorDocument::load(descriptor_path)?;
        let images = self.training_images(&descriptor)?;
        info!("Scanning {} images for rare classes...", images.len());

        let report = self.balance_images(&images);

        let base = descriptor.base_dir();
        let manifest_path = base.join(manifest_name);
        fs::write(&manifest_path, report.render())
            .map_err(|e| PipelineError::output(&manifest_path, e))?;

        let balanced_path = base.join(balanced_descriptor_name);
        descriptor.with_train(manifest_name).write(&balanced_path)?;

        info!("Created balanced manifest: {:?}", manifest_path);
        info!(
            "Original count: {}, balanced count: {}",
            report.source_images,
            report.manifest_entries()
        );
        Ok(report)
    }
}

/// Read an existing manifest; relative entries resolve against `base`.
fn read_manifest(path: &Path, base: &Path) -> PipelineResult<Vec<PathBuf>> {
    let content = fs::read_to_string(path).map_err(|e| PipelineError::unreadable(path, e))?;

    let mut images = Vec::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let entry = Path::new(line);
        let resolved = if entry.is_absolute() {
            entry.to_path_buf()
        } else {
            base.join(entry)
        };
        if resolved.exists() {
            images.push(resolved);
        } else {
            warn!("Manifest entry {:?} does not exist, dropping", resolved);
        }
    }
    Ok(images)
}
