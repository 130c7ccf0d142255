mod commit;
mod tag;
mod tree;

pub use commit::{Commit, Signature};
pub use tag::Tag;
pub use tree::{EntryMode, Tree, TreeEntry};
