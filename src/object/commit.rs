use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{ObjectKind, ObjectStore};
use crate::types::Commit;

/// write a commit to the object store
pub fn write_commit(store: &ObjectStore, commit: &Commit) -> Result<ObjectId> {
    store.put(ObjectKind::Commit, &commit.to_bytes())
}

/// read a commit from the object store
pub fn read_commit(store: &ObjectStore, id: &ObjectId) -> Result<Commit> {
    let data = store.get_kind(id, ObjectKind::Commit)?;
    Commit::parse(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::object::write_tree;
    use crate::repo::Repo;
    use crate::types::{Signature, Tree};
    use tempfile::tempdir;

    #[test]
    fn test_commit_write_read() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), HashAlgorithm::Sha1).unwrap();
        let store = ObjectStore::open(&repo);

        let tree = write_tree(&store, &Tree::empty()).unwrap();
        let commit = Commit::new(tree, vec![], Signature::new("a", "a@x", 10), "first\n");
        let id = write_commit(&store, &commit).unwrap();

        let read = read_commit(&store, &id).unwrap();
        assert_eq!(read, commit);
        assert!(read.is_root());
    }
}
