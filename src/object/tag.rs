use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{ObjectKind, ObjectStore};
use crate::types::Tag;

/// nesting limit when following tag chains
const MAX_PEEL_DEPTH: usize = 16;

/// write an annotated tag to the object store
pub fn write_tag(store: &ObjectStore, tag: &Tag) -> Result<ObjectId> {
    store.put(ObjectKind::Tag, &tag.to_bytes())
}

/// read an annotated tag from the object store
pub fn read_tag(store: &ObjectStore, id: &ObjectId) -> Result<Tag> {
    let data = store.get_kind(id, ObjectKind::Tag)?;
    Tag::parse(&data)
}

/// follow annotated tags until reaching a commit
pub fn peel_to_commit(store: &ObjectStore, id: &ObjectId) -> Result<ObjectId> {
    let mut current = *id;
    for _ in 0..MAX_PEEL_DEPTH {
        let (kind, _) = store.header(&current)?;
        match kind {
            ObjectKind::Commit => return Ok(current),
            ObjectKind::Tag => current = read_tag(store, &current)?.object,
            other => {
                return Err(Error::WrongKind {
                    id: current,
                    found: other.as_str(),
                    expected: "commit",
                })
            }
        }
    }
    Err(Error::CorruptObjectMessage(format!(
        "tag chain at {} nested too deeply",
        id
    )))
}
