use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

mod config;
mod core;
mod error;
mod logging;

use crate::config::PipelineConfig;
use crate::core::dataset::DESCRIPTOR_FILE;
use crate::core::taxonomy::class_label;
use crate::core::{BalanceReport, ConsolidationReport, DatasetConsolidator, ManifestBalancer};

/// Merge blood-cell detection datasets into one hierarchical taxonomy
#[derive(Parser, Debug)]
#[command(name = "hemo-dataset-builder")]
#[command(version)]
struct Args {
    /// JSON configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "hemo_builder.json", env = "HEMO_CONFIG")]
    config: PathBuf,

    /// Also write logs to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rebuild the consolidated dataset from the configured sources
    Consolidate {
        /// Copy images unchanged instead of applying CLAHE
        #[arg(long)]
        no_clahe: bool,
    },
    /// Write an oversampled training manifest for a consolidated dataset
    Balance {
        /// Consolidated dataset root; defaults to the configured output directory
        #[arg(long)]
        dataset: Option<PathBuf>,
    },
    /// Consolidate, then balance the result
    All {
        #[arg(long)]
        no_clahe: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_logging(args.log_dir.as_deref()).context("Failed to set up logging")?;

    let mut config = PipelineConfig::load(&args.config)?;
    config.apply_env_overrides()?;
    if let Command::Consolidate { no_clahe: true } | Command::All { no_clahe: true } = args.command {
        config.apply_clahe = false;
    }
    config.validate()?;
    info!("Configuration: {:?}", config);

    match &args.command {
        Command::Consolidate { .. } => {
            let report = consolidate(&config)?;
            print_consolidation(&report);
        }
        Command::Balance { dataset } => {
            let root = dataset.clone().unwrap_or_else(|| config.output_dir.clone());
            let report = balance(&config, root)?;
            print_balance(&report);
        }
        Command::All { .. } => {
            let report = consolidate(&config)?;
            print_consolidation(&report);
            let report = balance(&config, config.output_dir.clone())?;
            print_balance(&report);
        }
    }
    Ok(())
}

fn consolidate(config: &PipelineConfig) -> Result<ConsolidationReport> {
    let consolidator = DatasetConsolidator::new(config)?;
    consolidator.run().map_err(|e| {
        error!("Consolidation aborted: {}", e);
        e.into()
    })
}

fn balance(config: &PipelineConfig, dataset_root: PathBuf) -> Result<BalanceReport> {
    let descriptor = dataset_root.join(DESCRIPTOR_FILE);
    ManifestBalancer::new(&config.oversample)
        .run(
            &descriptor,
            &config.manifest_name,
            &config.balanced_descriptor_name,
        )
        .with_context(|| format!("Failed to balance {:?}", descriptor))
}

fn print_consolidation(report: &ConsolidationReport) {
    println!("\nConsolidated dataset: {}", report.output_dir.display());
    for dataset in &report.datasets {
        if let Some(reason) = &dataset.error {
            println!("  {}: skipped ({})", dataset.id, reason);
            continue;
        }
        println!(
            "  {}: {} classes mapped, {} ignored",
            dataset.id,
            dataset.mapped_classes,
            dataset.ignored_classes.len()
        );
        for split in &dataset.splits {
            let name = split.split.map(|s| s.as_str().to_string()).unwrap_or_default();
            println!(
                "    [{}] from {}: images {} (enhanced {}, copied {}, fallback {}), labels {}, empty {}, skipped {}",
                name,
                split.source_dir.display(),
                split.images,
                split.enhanced,
                split.copied,
                split.fallback_copies,
                split.labels_written,
                split.labels_emptied,
                split.skipped
            );
            if split.dropped_lines + split.malformed_lines > 0 {
                println!(
                    "      dropped lines {}, malformed lines {}",
                    split.dropped_lines, split.malformed_lines
                );
            }
        }
        for (split, reason) in &dataset.failed_splits {
            println!("    [{}] FAILED: {}", split.as_str(), reason);
        }
    }
    println!("  Total images: {}", report.total_images());
    println!("  Class instances ({} total):", report.class_counts.total());
    for (class_id, count) in report.class_counts.iter() {
        println!("    {} {}: {}", class_id, class_label(class_id), count);
    }
    println!("  Descriptor: {}", report.descriptor_path.display());
}

fn print_balance(report: &BalanceReport) {
    println!("\nBalanced manifest");
    println!("  Original count: {}", report.source_images);
    println!("  Balanced count: {}", report.manifest_entries());
    println!(
        "  Boosted images: {}, background: {}, layout mismatches: {}, unreadable labels: {}, malformed lines: {}",
        report.boosted_images,
        report.background_images,
        report.skipped_layout,
        report.unreadable_labels,
        report.malformed_lines
    );
    println!("  Class counts (raw instances):");
    for line in report.class_counts.summary_lines() {
        println!("    {}", line);
    }
}
