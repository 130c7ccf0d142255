//! read and write operations on a single repository

pub(crate) mod connectivity;
mod history;
mod snapshot;
mod tag;
mod tree_reader;

pub use connectivity::{check_connectivity, is_ancestor, reachable};
pub use history::{history, CommitSummary};
pub use snapshot::snapshot;
pub use tag::create_tag;
pub use tree_reader::{file_tree, list_dir, read_file, FileTreeNode};
