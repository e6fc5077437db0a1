pub mod cli;
pub mod error;
pub mod item;

pub use cli::{parse_args, Args};
pub use error::{InduError, InduResult};
pub use item::{DirSummary, ExtInfo, OutputSink};
