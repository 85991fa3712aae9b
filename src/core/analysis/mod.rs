mod class_stats;
mod manifest;

pub use class_stats::ClassFrequencyStats;
pub use manifest::{BalanceReport, ManifestBalancer};
