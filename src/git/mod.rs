pub mod head;
pub mod mirror;
pub mod runner;

pub use head::{read_head, read_head_cached, DUMMY_BRANCH};
pub use mirror::{FetchArgs, MirrorCache, MirrorError};
pub use runner::{Git, GitCliError, GitOutput, GIT_FATAL_EXIT};
