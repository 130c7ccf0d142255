use serde::Serialize;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{peel_to_commit, read_blob, read_commit, read_tree, ObjectStore};
use crate::refs::resolve;
use crate::repo::Repo;
use crate::types::{EntryMode, Tree, TreeEntry};

/// one entry of a flattened file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTreeNode {
    /// position in the listing
    pub id: i64,
    /// id of the containing directory, -1 at top level
    pub parent_id: i64,
    pub name: String,
    /// slash-separated path from the root
    pub path: String,
    pub is_directory: bool,
    pub file_id: ObjectId,
    pub mode: String,
    /// blob size; none for directories and submodules
    pub size: Option<u64>,
    pub extension: Option<String>,
}

impl FileTreeNode {
    fn new(store: &ObjectStore, id: i64, parent_id: i64, path: String, entry: &TreeEntry) -> Result<Self> {
        let is_directory = entry.is_tree();
        let size = match entry.mode {
            EntryMode::Tree | EntryMode::Gitlink => None,
            _ => Some(store.header(&entry.id)?.1 as u64),
        };
        let extension = if is_directory {
            None
        } else {
            extension_of(&entry.name)
        };
        Ok(Self {
            id,
            parent_id,
            name: entry.name.clone(),
            path,
            is_directory,
            file_id: entry.id,
            mode: entry.mode.display().to_string(),
            size,
            extension,
        })
    }
}

fn extension_of(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_string()),
        _ => None,
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn root_tree(repo: &Repo, store: &ObjectStore, branch: &str) -> Result<Tree> {
    let tip = peel_to_commit(store, &resolve(repo, branch)?)?;
    let commit = read_commit(store, &tip)?;
    read_tree(store, &commit.tree)
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

/// walk `path` down from `tree`; `None` means the root itself
fn lookup(store: &ObjectStore, tree: &Tree, path: &str) -> Result<Option<TreeEntry>> {
    let parts = components(path);
    let Some((last, dirs)) = parts.split_last() else {
        return Ok(None);
    };

    let mut current = tree.clone();
    let mut walked = String::new();
    for part in dirs {
        walked = join(&walked, part);
        let entry = current
            .get(part)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        if !entry.is_tree() {
            return Err(Error::NotADirectory(walked));
        }
        current = read_tree(store, &entry.id)?;
    }

    current
        .get(last)
        .cloned()
        .map(Some)
        .ok_or_else(|| Error::PathNotFound(path.to_string()))
}

/// the whole tree at the tip of `branch`, directories before their contents
pub fn file_tree(repo: &Repo, branch: &str) -> Result<Vec<FileTreeNode>> {
    let store = ObjectStore::open(repo);
    let tree = root_tree(repo, &store, branch)?;
    let mut nodes = Vec::new();
    collect(&store, &tree, "", -1, &mut nodes)?;
    Ok(nodes)
}

fn collect(
    store: &ObjectStore,
    tree: &Tree,
    prefix: &str,
    parent_id: i64,
    nodes: &mut Vec<FileTreeNode>,
) -> Result<()> {
    for entry in tree.entries() {
        let id = nodes.len() as i64;
        let path = join(prefix, &entry.name);
        nodes.push(FileTreeNode::new(store, id, parent_id, path.clone(), entry)?);
        if entry.is_tree() {
            let subtree = read_tree(store, &entry.id)?;
            collect(store, &subtree, &path, id, nodes)?;
        }
    }
    Ok(())
}

/// one level of the directory at `path` ("" for the root)
pub fn list_dir(repo: &Repo, branch: &str, path: &str) -> Result<Vec<FileTreeNode>> {
    let store = ObjectStore::open(repo);
    let root = root_tree(repo, &store, branch)?;
    let prefix = components(path).join("/");
    let tree = match lookup(&store, &root, path)? {
        None => root,
        Some(entry) if entry.is_tree() => read_tree(&store, &entry.id)?,
        Some(_) => return Err(Error::NotADirectory(prefix)),
    };

    tree.entries()
        .iter()
        .enumerate()
        .map(|(i, entry)| FileTreeNode::new(&store, i as i64, -1, join(&prefix, &entry.name), entry))
        .collect()
}

/// contents of the file at `path` on `branch`
///
/// symlinks yield their target.
pub fn read_file(repo: &Repo, branch: &str, path: &str) -> Result<Vec<u8>> {
    let store = ObjectStore::open(repo);
    let root = root_tree(repo, &store, branch)?;
    let entry = match lookup(&store, &root, path)? {
        Some(entry) => entry,
        None => return Err(Error::NotAFile(path.to_string())),
    };
    match entry.mode {
        EntryMode::Tree => Err(Error::NotAFile(path.to_string())),
        EntryMode::Gitlink => Err(Error::Unsupported(format!("{} is a submodule", path))),
        _ => read_blob(&store, &entry.id),
    }
}
