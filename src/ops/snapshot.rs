use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::{write_blob, write_commit, write_tree, ObjectStore};
use crate::refs::{branch_ref, try_read_ref, update_ref};
use crate::repo::Repo;
use crate::types::{Commit, EntryMode, Signature, Tree, TreeEntry};

/// record the contents of `source` as a new commit on `branch`
///
/// the previous tip, if any, becomes the parent. `.git` directories and
/// special files are skipped, and so are directories with nothing to record.
pub fn snapshot(
    repo: &Repo,
    source: &Path,
    branch: &str,
    message: &str,
    author: &Signature,
) -> Result<ObjectId> {
    let store = ObjectStore::open(repo);
    let tree = snapshot_dir(&store, source)?.unwrap_or_else(Tree::empty);
    let tree_id = write_tree(&store, &tree)?;

    let name = branch_ref(branch);
    let parent = try_read_ref(repo, &name)?;
    let mut message = message.to_string();
    if !message.ends_with('\n') {
        message.push('\n');
    }
    let commit = Commit::new(tree_id, parent.into_iter().collect(), author.clone(), message);
    let id = write_commit(&store, &commit)?;
    update_ref(repo, &name, &id, parent.as_ref())?;

    info!(branch, commit = %id, entries = tree.len(), "recorded snapshot");
    Ok(id)
}

fn snapshot_dir(store: &ObjectStore, dir: &Path) -> Result<Option<Tree>> {
    let mut dir_entries: Vec<_> = fs::read_dir(dir)
        .with_path(dir)?
        .collect::<std::io::Result<Vec<_>>>()
        .with_path(dir)?;
    dir_entries.sort_by_key(|e| e.file_name());

    let mut entries = Vec::new();
    for entry in dir_entries {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name == ".git" {
            continue;
        }
        let meta = fs::symlink_metadata(&path).with_path(&path)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            if let Some(subtree) = snapshot_dir(store, &path)? {
                entries.push(TreeEntry::new(name, EntryMode::Tree, write_tree(store, &subtree)?));
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path).with_path(&path)?;
            let id = write_blob(store, target.as_os_str().as_bytes())?;
            entries.push(TreeEntry::new(name, EntryMode::Symlink, id));
        } else if file_type.is_file() {
            let content = fs::read(&path).with_path(&path)?;
            let mode = if meta.permissions().mode() & 0o111 != 0 {
                EntryMode::Executable
            } else {
                EntryMode::Regular
            };
            entries.push(TreeEntry::new(name, mode, write_blob(store, &content)?));
        } else {
            debug!(path = %path.display(), "skipping special file");
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    Tree::new(entries).map(Some)
}
