//! fixtures shared by unit tests

use std::collections::BTreeMap;
use std::path::Path;

use crate::hash::{HashAlgorithm, ObjectId};
use crate::object::{write_blob, write_commit, write_tree, ObjectStore};
use crate::refs::{branch_ref, try_read_ref, update_ref, write_symbolic};
use crate::repo::Repo;
use crate::types::{Commit, EntryMode, Signature, Tree, TreeEntry};

/// a repository to serve as a remote, HEAD on `main`
pub(crate) fn remote_repo(dir: &Path, name: &str) -> Repo {
    let repo = Repo::init(&dir.join(name), HashAlgorithm::Sha1).unwrap();
    write_symbolic(&repo, "HEAD", "refs/heads/main").unwrap();
    repo
}

enum Node<'a> {
    File(&'a [u8]),
    Dir(BTreeMap<&'a str, Node<'a>>),
}

fn write_node(store: &ObjectStore, entries: &BTreeMap<&str, Node<'_>>) -> ObjectId {
    let mut out = Vec::new();
    for (name, node) in entries {
        let entry = match node {
            Node::File(content) => {
                TreeEntry::new(*name, EntryMode::Regular, write_blob(store, content).unwrap())
            }
            Node::Dir(children) => TreeEntry::new(*name, EntryMode::Tree, write_node(store, children)),
        };
        out.push(entry);
    }
    write_tree(store, &Tree::new(out).unwrap()).unwrap()
}

/// write `files` (slash-separated paths) as a tree
pub(crate) fn write_files<C: AsRef<[u8]>>(store: &ObjectStore, files: &[(&str, C)]) -> ObjectId {
    let mut root: BTreeMap<&str, Node<'_>> = BTreeMap::new();
    for (path, content) in files {
        let mut parts: Vec<&str> = path.split('/').collect();
        let file = parts.pop().unwrap();
        let mut dir = &mut root;
        for part in parts {
            let node = dir.entry(part).or_insert_with(|| Node::Dir(BTreeMap::new()));
            dir = match node {
                Node::Dir(children) => children,
                Node::File(_) => panic!("{} is a file", part),
            };
        }
        dir.insert(file, Node::File(content.as_ref()));
    }
    write_node(store, &root)
}

/// commit `files` on top of `branch` at time `t` and advance the branch
pub(crate) fn commit_on<C: AsRef<[u8]>>(
    repo: &Repo,
    branch: &str,
    files: &[(&str, C)],
    t: i64,
) -> ObjectId {
    let store = ObjectStore::open(repo);
    let tree = write_files(&store, files);
    let name = branch_ref(branch);
    let parent = try_read_ref(repo, &name).unwrap();
    let commit = Commit::new(
        tree,
        parent.into_iter().collect(),
        Signature::new("Test", "test@example.com", t),
        format!("commit at {}\n", t),
    );
    let id = write_commit(&store, &commit).unwrap();
    update_ref(repo, &name, &id, parent.as_ref()).unwrap();
    id
}
