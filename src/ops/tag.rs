use tracing::info;

use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{write_tag, ObjectStore};
use crate::refs::{resolve, update_ref, TAGS};
use crate::repo::Repo;
use crate::types::{Signature, Tag};

/// create an annotated tag `name` pointing at whatever `target` resolves to
///
/// fails with a ref conflict if the tag already exists.
pub fn create_tag(
    repo: &Repo,
    name: &str,
    target: &str,
    tagger: &Signature,
    message: &str,
) -> Result<ObjectId> {
    let store = ObjectStore::open(repo);
    let object = resolve(repo, target)?;
    let (kind, _) = store.header(&object)?;

    let mut message = message.to_string();
    if !message.ends_with('\n') {
        message.push('\n');
    }
    let tag = Tag::new(object, kind, name, tagger.clone(), message);
    let id = write_tag(&store, &tag)?;
    update_ref(repo, &format!("{}{}", TAGS, name), &id, None)?;

    info!(tag = name, %object, "created tag");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};
    use crate::object::{peel_to_commit, read_tag, ObjectKind};
    use crate::testutil::{commit_on, remote_repo};
    use tempfile::tempdir;

    #[test]
    fn test_create_annotated_tag() {
        let dir = tempdir().unwrap();
        let repo = remote_repo(dir.path(), "r");
        let tip = commit_on(&repo, "main", &[("f", "x")], 5);
        let tagger = Signature::new("T", "t@example.com", 6);

        let id = create_tag(&repo, "v1.0", "main", &tagger, "release").unwrap();
        let store = ObjectStore::open(&repo);
        let tag = read_tag(&store, &id).unwrap();
        assert_eq!(tag.object, tip);
        assert_eq!(tag.target_kind, ObjectKind::Commit);
        assert_eq!(tag.name, "v1.0");
        assert_eq!(resolve(&repo, "v1.0").unwrap(), id);
        assert_eq!(peel_to_commit(&store, &id).unwrap(), tip);
    }

    #[test]
    fn test_duplicate_tag_conflicts() {
        let dir = tempdir().unwrap();
        let repo = remote_repo(dir.path(), "r");
        commit_on(&repo, "main", &[("f", "x")], 5);
        let tagger = Signature::new("T", "t@example.com", 6);

        create_tag(&repo, "v1", "main", &tagger, "one").unwrap();
        let err = create_tag(&repo, "v1", "main", &tagger, "again").unwrap_err();
        assert!(matches!(err, Error::RefConflict { .. }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_tag_unknown_target() {
        let dir = tempdir().unwrap();
        let repo = remote_repo(dir.path(), "r");
        let tagger = Signature::new("T", "t@example.com", 6);
        let err = create_tag(&repo, "v1", "nope", &tagger, "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
