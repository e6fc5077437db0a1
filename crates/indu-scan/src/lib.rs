pub mod exclude;
pub mod walk;

pub use exclude::ExcludePatterns;
pub use walk::{scan, ScanOptions};
