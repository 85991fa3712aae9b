use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::formatter::BracketedFormatter;

const DEFAULT_FILTER: &str = "hemo_dataset_builder=info";

/// Install the global subscriber: stdout always, plus a timestamped log file
/// when `log_dir` is given. Returns the log file path.
pub fn setup_logging(log_dir: Option<&Path>) -> std::io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stdout_layer = fmt::layer()
        .event_format(BracketedFormatter)
        .with_writer(std::io::stdout);

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let log_path = dir.join(format!("hemo_builder_{}.log", timestamp));
            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&log_path)?;

            let layer = fmt::layer()
                .event_format(BracketedFormatter)
                .with_writer(Mutex::new(file))
                .with_ansi(false);
            (Some(layer), Some(log_path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(path) = &log_path {
        info!("Log file created at: {:?}", path);
    }
    Ok(log_path)
}
