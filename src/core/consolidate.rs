use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, SourceDataset};
use crate::core::analysis::ClassFrequencyStats;
use crate::core::dataset::{
    list_split_images, read_class_names, remap_label_file, DatasetSplit, SplitDirs,
    UnifiedDescriptor, DESCRIPTOR_FILE, IMAGES_DIR, LABELS_DIR, LABEL_EXTENSION,
};
use crate::core::image::{enhance_file, Enhancement};
use crate::core::taxonomy::{build_class_mapping, ClassMapping};
use crate::error::{PipelineError, PipelineResult};

/// Counts for one source split written into the consolidated dataset
#[derive(Debug, Clone, Default)]
pub struct SplitReport {
    pub split: Option<DatasetSplit>,
    pub source_dir: PathBuf,
    pub images: usize,
    pub enhanced: usize,
    pub copied: usize,
    /// Copies made because enhancement could not decode or encode the image
    pub fallback_copies: usize,
    pub labels_written: usize,
    /// Label files whose every line was dropped
    pub labels_emptied: usize,
    pub dropped_lines: usize,
    pub malformed_lines: usize,
    pub skipped: usize,
    pub class_counts: ClassFrequencyStats,
}

impl SplitReport {
    fn merge(mut self, other: SplitReport) -> SplitReport {
        self.images += other.images;
        self.enhanced += other.enhanced;
        self.copied += other.copied;
        self.fallback_copies += other.fallback_copies;
        self.labels_written += other.labels_written;
        self.labels_emptied += other.labels_emptied;
        self.dropped_lines += other.dropped_lines;
        self.malformed_lines += other.malformed_lines;
        self.skipped += other.skipped;
        self.class_counts.merge(&other.class_counts);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetReport {
    pub id: String,
    pub mapped_classes: usize,
    pub ignored_classes: Vec<(u32, String)>,
    pub splits: Vec<SplitReport>,
    pub failed_splits: Vec<(DatasetSplit, String)>,
    /// Set when the whole dataset was skipped
    pub error: Option<String>,
}

impl DatasetReport {
    pub fn images(&self) -> usize {
        self.splits.iter().map(|s| s.images).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidationReport {
    pub output_dir: PathBuf,
    pub descriptor_path: PathBuf,
    pub datasets: Vec<DatasetReport>,
    pub class_counts: ClassFrequencyStats,
}

impl ConsolidationReport {
    pub fn total_images(&self) -> usize {
        self.datasets.iter().map(DatasetReport::images).sum()
    }
}

/// How an image reached the output directory
enum ImageWrite {
    Enhanced,
    Copied,
    FallbackCopy,
}

/// Read-only inputs shared by the workers of one split
struct SplitContext<'a> {
    dataset_id: &'a str,
    mapping: &'a ClassMapping,
    source_labels: PathBuf,
    dirs: SplitDirs,
}

/// Merges several source datasets into one dataset under the fixed taxonomy.
pub struct DatasetConsolidator<'a> {
    config: &'a PipelineConfig,
    pool: ThreadPool,
}

impl<'a> DatasetConsolidator<'a> {
    pub fn new(config: &'a PipelineConfig) -> PipelineResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers.unwrap_or(0))
            .thread_name(|i| format!("consolidate-{}", i))
            .build()?;
        Ok(Self { config, pool })
    }

    /// Rebuild the output dataset from scratch.
    ///
    /// Failures inside one dataset or split are logged and recorded in the
    /// report; only output-root failures abort the run.
    pub fn run(&self) -> PipelineResult<ConsolidationReport> {
        let root = &self.config.output_dir;
        prepare_output(root)?;

        info!(
            "CLAHE enhancement: {}",
            if self.config.apply_clahe { "ENABLED" } else { "DISABLED" }
        );

        let mut datasets = Vec::with_capacity(self.config.sources.len());
        let mut class_counts = ClassFrequencyStats::new();

        for source in &self.config.sources {
            let report = self.consolidate_source(source);
            for split in &report.splits {
                class_counts.merge(&split.class_counts);
            }
            datasets.push(report);
        }

        let absolute_root = fs::canonicalize(root).map_err(|e| PipelineError::output(root, e))?;
        let descriptor_path = root.join(DESCRIPTOR_FILE);
        UnifiedDescriptor::for_root(&absolute_root).write(&descriptor_path)?;
        info!("Wrote dataset descriptor {:?}", descriptor_path);

        Ok(ConsolidationReport {
            output_dir: root.clone(),
            descriptor_path,
            datasets,
            class_counts,
        })
    }

    fn consolidate_source(&self, source: &SourceDataset) -> DatasetReport {
        let mut report = DatasetReport {
            id: source.id.clone(),
            ..Default::default()
        };

        let dataset_root = self.config.source_root(source);
        let descriptor = dataset_root.join(DESCRIPTOR_FILE);
        if !descriptor.is_file() {
            warn!("Skipping {}: no {:?}", source.id, descriptor);
            report.error = Some(format!("missing descriptor {:?}", descriptor));
            return report;
        }

        let names = match read_class_names(&descriptor) {
            Ok(names) => names,
            Err(e) => {
                error!("Skipping {}: {}", source.id, e);
                report.error = Some(e.to_string());
                return report;
            }
        };

        let mapping = build_class_mapping(&source.id, &names);
        report.mapped_classes = mapping.mapped_count();
        report.ignored_classes = mapping.ignored().to_vec();

        for split in DatasetSplit::ALL {
            let Some(split_dir) = split.resolve_in(&dataset_root) else {
                debug!("{} has no {} split", source.id, split.as_str());
                continue;
            };

            let ctx = SplitContext {
                dataset_id: &source.id,
                mapping: &mapping,
                source_labels: split_dir.join(LABELS_DIR),
                dirs: SplitDirs::new(&self.config.output_dir, split),
            };

            match self.consolidate_split(&ctx, &split_dir) {
                Ok(mut split_report) => {
                    split_report.split = Some(split);
                    split_report.source_dir = split_dir;
                    info!(
                        "{} [{}]: {} images, {} labels, {} skipped",
                        source.id,
                        split.as_str(),
                        split_report.images,
                        split_report.labels_written,
                        split_report.skipped
                    );
                    report.splits.push(split_report);
                }
                Err(e) => {
                    error!("{} [{}] aborted: {}", source.id, split.as_str(), e);
                    report.failed_splits.push((split, e.to_string()));
                }
            }
        }

        report
    }

    fn consolidate_split(&self, ctx: &SplitContext, split_dir: &Path) -> PipelineResult<SplitReport> {
        let images = list_split_images(&split_dir.join(IMAGES_DIR))?;
        info!(
            "Processing {} [{}]: {} images...",
            ctx.dataset_id,
            split_dir.display(),
            images.len()
        );

        self.pool.install(|| {
            images
                .par_iter()
                .try_fold(SplitReport::default, |mut tally, image_path| {
                    match self.process_image(ctx, image_path, &mut tally) {
                        Ok(()) => Ok(tally),
                        Err(e) if e.is_recoverable() => {
                            warn!("Skipping {:?}: {}", image_path, e);
                            tally.skipped += 1;
                            Ok(tally)
                        }
                        Err(e) => Err(e),
                    }
                })
                .try_reduce(SplitReport::default, |a, b| Ok(a.merge(b)))
        })
    }

    fn process_image(
        &self,
        ctx: &SplitContext,
        image_path: &Path,
        tally: &mut SplitReport,
    ) -> PipelineResult<()> {
        let (Some(file_name), Some(stem)) = (image_path.file_name(), image_path.file_stem()) else {
            return Err(PipelineError::LayoutMismatch {
                path: image_path.to_path_buf(),
            });
        };
        let file_name = file_name.to_string_lossy();
        let stem = stem.to_string_lossy();

        let target = ctx
            .dirs
            .images
            .join(format!("{}_{}", ctx.dataset_id, file_name));
        match self.write_image(image_path, &target)? {
            ImageWrite::Enhanced => tally.enhanced += 1,
            ImageWrite::Copied => tally.copied += 1,
            ImageWrite::FallbackCopy => {
                tally.copied += 1;
                tally.fallback_copies += 1;
            }
        }
        tally.images += 1;

        let source_label = ctx.source_labels.join(format!("{}.{}", stem, LABEL_EXTENSION));
        if !source_label.is_file() {
            return Ok(());
        }

        let target_label = ctx
            .dirs
            .labels
            .join(format!("{}_{}.{}", ctx.dataset_id, stem, LABEL_EXTENSION));
        let outcome = match remap_label_file(&source_label, &target_label, ctx.mapping) {
            Ok(outcome) => outcome,
            Err(e) if e.is_recoverable() => {
                // The image stays in place and is treated as background.
                warn!("Label {:?} skipped: {}", source_label, e);
                tally.skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tally.dropped_lines += outcome.dropped;
        tally.malformed_lines += outcome.malformed;
        if outcome.is_empty() {
            tally.labels_emptied += 1;
        } else {
            tally.labels_written += 1;
        }
        for line in &outcome.lines {
            tally.class_counts.record(line.class_id);
        }
        Ok(())
    }

    fn write_image(&self, source: &Path, target: &Path) -> PipelineResult<ImageWrite> {
        if !self.config.apply_clahe {
            copy_bytes(source, target)?;
            return Ok(ImageWrite::Copied);
        }

        match enhance_file(source, &self.config.clahe) {
            Enhancement::Enhanced(img) => match img.save(target) {
                Ok(()) => Ok(ImageWrite::Enhanced),
                Err(e) => {
                    warn!("Could not encode {:?} ({}), copying original", target, e);
                    copy_bytes(source, target)?;
                    Ok(ImageWrite::FallbackCopy)
                }
            },
            Enhancement::Undecodable(reason) => {
                debug!("Could not decode {:?} ({}), copying original", source, reason);
                copy_bytes(source, target)?;
                Ok(ImageWrite::FallbackCopy)
            }
        }
    }
}

fn copy_bytes(source: &Path, target: &Path) -> PipelineResult<()> {
    let bytes = fs::read(source).map_err(|e| PipelineError::unreadable(source, e))?;
    fs::write(target, bytes).map_err(|e| PipelineError::output(target, e))
}

/// Remove any previous output and create the split directories.
fn prepare_output(root: &Path) -> PipelineResult<()> {
    if root.exists() {
        info!("Re-building output directory: {:?}", root);
        fs::remove_dir_all(root).map_err(|e| PipelineError::output(root, e))?;
    }
    for split in DatasetSplit::ALL {
        SplitDirs::new(root, split).create()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::BTreeSet;

    fn write_png(path: &Path, seed: u8) {
        RgbImage::from_fn(16, 12, |x, y| Rgb([seed, (x * 8) as u8, (y * 10) as u8]))
            .save(path)
            .unwrap();
    }

    fn make_source(root: &Path, names: &str, split: &str, items: &[(&str, Option<&str>)]) {
        fs::create_dir_all(root.join(split).join("images")).unwrap();
        fs::create_dir_all(root.join(split).join("labels")).unwrap();
        fs::write(root.join("data.yaml"), format!("names: {}\n", names)).unwrap();
        for (i, (stem, label)) in items.iter().enumerate() {
            write_png(&root.join(split).join("images").join(format!("{}.png", stem)), i as u8 * 20);
            if let Some(label) = label {
                fs::write(root.join(split).join("labels").join(format!("{}.txt", stem)), label).unwrap();
            }
        }
    }

    fn config_for(workspace: &Path, ids: &[&str], apply_clahe: bool) -> PipelineConfig {
        PipelineConfig {
            workspace: workspace.join("sources"),
            sources: ids.iter().map(|id| SourceDataset::new(id)).collect(),
            output_dir: workspace.join("merged"),
            apply_clahe,
            workers: Some(2),
            ..PipelineConfig::default()
        }
    }

    fn relative_files(root: &Path) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.insert(path.strip_prefix(root).unwrap().to_string_lossy().to_string());
                }
            }
        }
        files
    }

    fn fixture(tmp: &Path) {
        let sources = tmp.join("sources");
        make_source(
            &sources.join("BCCD"),
            "['RBC', 'WBC', 'Platelets']",
            "train",
            &[("img1", Some("1 0.5 0.5 0.2 0.2\n0 0.1 0.1 0.05 0.05")), ("img2", None)],
        );
        make_source(
            &sources.join("Raabin"),
            "['Neutrophil', 'artifact']",
            "val",
            &[("img1", Some("0 0.4 0.4 0.3 0.3")), ("img3", Some("1 0.2 0.2 0.1 0.1"))],
        );
    }

    #[test]
    fn test_merges_sources_with_prefixes_and_aliases() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let config = config_for(tmp.path(), &["BCCD", "Raabin"], false);

        let report = DatasetConsolidator::new(&config).unwrap().run().unwrap();
        let out = &config.output_dir;

        assert!(out.join("train/images/BCCD_img1.png").is_file());
        assert!(out.join("train/images/BCCD_img2.png").is_file());
        assert!(out.join("valid/images/Raabin_img1.png").is_file());
        assert!(out.join("valid/images/Raabin_img3.png").is_file());
        assert!(out.join("test/images").is_dir());

        assert_eq!(
            fs::read_to_string(out.join("train/labels/BCCD_img1.txt")).unwrap(),
            "3 0.5 0.5 0.2 0.2\n0 0.1 0.1 0.05 0.05"
        );
        assert_eq!(
            fs::read_to_string(out.join("valid/labels/Raabin_img1.txt")).unwrap(),
            "3 0.4 0.4 0.3 0.3\n4 0.4 0.4 0.3 0.3"
        );
        // every line of img3 was dropped, so no label file exists
        assert!(!out.join("valid/labels/Raabin_img3.txt").exists());
        assert!(!out.join("train/labels/BCCD_img2.txt").exists());

        assert_eq!(report.total_images(), 4);
        assert_eq!(report.class_counts.get(3), 2);
        assert_eq!(report.class_counts.get(0), 1);
        assert_eq!(report.class_counts.get(4), 1);
        assert_eq!(report.datasets[1].ignored_classes, vec![(1, "artifact".to_string())]);
        assert_eq!(report.datasets[1].splits[0].labels_emptied, 1);

        let descriptor: UnifiedDescriptor =
            serde_yaml::from_str(&fs::read_to_string(&report.descriptor_path).unwrap()).unwrap();
        assert_eq!(descriptor.nc, 9);
        assert_eq!(descriptor.names[3], "WBC_Base");
        assert!(descriptor.path.is_absolute());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let config = config_for(tmp.path(), &["BCCD", "Raabin"], true);
        let consolidator = DatasetConsolidator::new(&config).unwrap();

        let first = consolidator.run().unwrap();
        let first_files = relative_files(&config.output_dir);
        fs::write(config.output_dir.join("train/images/stale.png"), b"old").unwrap();

        let second = consolidator.run().unwrap();
        assert_eq!(relative_files(&config.output_dir), first_files);
        assert_eq!(first.class_counts, second.class_counts);
    }

    #[test]
    fn test_corrupt_image_falls_back_to_copy() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let broken = tmp.path().join("sources/BCCD/train/images/broken.jpg");
        fs::write(&broken, b"not an image").unwrap();
        fs::write(tmp.path().join("sources/BCCD/train/images/.hidden.png"), b"x").unwrap();
        fs::create_dir(tmp.path().join("sources/BCCD/train/images/subdir")).unwrap();

        let config = config_for(tmp.path(), &["BCCD"], true);
        let report = DatasetConsolidator::new(&config).unwrap().run().unwrap();

        let copied = config.output_dir.join("train/images/BCCD_broken.jpg");
        assert_eq!(fs::read(&copied).unwrap(), b"not an image");
        assert!(!config.output_dir.join("train/images/BCCD_.hidden.png").exists());

        let split = &report.datasets[0].splits[0];
        assert_eq!(split.images, 3);
        assert_eq!(split.enhanced, 2);
        assert_eq!(split.fallback_copies, 1);
    }

    #[test]
    fn test_bad_dataset_does_not_abort_run() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let bad = tmp.path().join("sources/Broken");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("data.yaml"), "names: [unclosed\n").unwrap();

        let config = config_for(tmp.path(), &["Broken", "Missing", "BCCD"], false);
        let report = DatasetConsolidator::new(&config).unwrap().run().unwrap();

        assert!(report.datasets[0].error.is_some());
        assert!(report.datasets[1].error.is_some());
        assert!(report.datasets[2].error.is_none());
        assert_eq!(report.total_images(), 2);
    }
}
