mod args;
mod driver;
mod progress;
mod types;
mod write;

pub use args::{BoxedFitter, ResolverConfig, SolverChoice};
pub use driver::{ChainResolverApp, ChainResolverError, CONFIG_FILE_NAME, ENV_PREFIX};
pub use progress::ProgressRecord;
pub use types::{FragmentRecord, GroupOutput, GroupRecord, GroupStatus, InputDocument};
