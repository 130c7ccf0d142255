use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{ObjectKind, ObjectStore};

/// write a blob to the object store
pub fn write_blob(store: &ObjectStore, content: &[u8]) -> Result<ObjectId> {
    store.put(ObjectKind::Blob, content)
}

/// read blob content, failing if the id names another kind
pub fn read_blob(store: &ObjectStore, id: &ObjectId) -> Result<Vec<u8>> {
    store.get_kind(id, ObjectKind::Blob)
}

/// heuristic used by git: a NUL byte in the first 8000 bytes means binary
pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(8000).any(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::repo::Repo;
    use tempfile::tempdir;

    #[test]
    fn test_blob_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("r"), HashAlgorithm::Sha256).unwrap();
        let store = ObjectStore::open(&repo);

        let id = write_blob(&store, b"content").unwrap();
        assert_eq!(id.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(read_blob(&store, &id).unwrap(), b"content");
    }

    #[test]
    fn test_is_binary() {
        assert!(!is_binary(b"plain text\n"));
        assert!(is_binary(b"\x89PNG\r\n\x1a\n\0\0"));
        assert!(!is_binary(b""));
    }
}
