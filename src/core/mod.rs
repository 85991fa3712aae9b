pub mod analysis;
pub mod consolidate;
pub mod dataset;
pub mod image;
pub mod taxonomy;

pub use analysis::{BalanceReport, ManifestBalancer};
pub use consolidate::{ConsolidationReport, DatasetConsolidator};
