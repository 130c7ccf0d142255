use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{ObjectKind, ObjectStore};
use crate::types::Tree;

/// write a tree to the object store
pub fn write_tree(store: &ObjectStore, tree: &Tree) -> Result<ObjectId> {
    store.put(ObjectKind::Tree, &tree.to_bytes())
}

/// read a tree from the object store
pub fn read_tree(store: &ObjectStore, id: &ObjectId) -> Result<Tree> {
    let data = store.get_kind(id, ObjectKind::Tree)?;
    Tree::parse(&data, store.algorithm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::object::write_blob;
    use crate::repo::Repo;
    use crate::types::{EntryMode, TreeEntry};
    use crate::Error;
    use tempfile::tempdir;

    #[test]
    fn test_tree_write_read() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), HashAlgorithm::Sha1).unwrap();
        let store = ObjectStore::open(&repo);

        let blob = write_blob(&store, b"fn main() {}\n").unwrap();
        let tree = Tree::new(vec![TreeEntry::new("main.rs", EntryMode::Regular, blob)]).unwrap();
        let id = write_tree(&store, &tree).unwrap();

        assert_eq!(read_tree(&store, &id).unwrap(), tree);
        assert!(matches!(read_tree(&store, &blob), Err(Error::WrongKind { .. })));
    }
}
