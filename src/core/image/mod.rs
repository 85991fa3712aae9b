mod clahe;
mod enhance;

pub use clahe::ClaheParams;
pub use enhance::{enhance_file, Enhancement};
