//! content-addressed loose object store
//!
//! objects live at `objects/<2 hex>/<rest>` as zlib-compressed
//! `"<kind> <len>\0<content>"`, the same layout git uses, so a repository
//! written here can be inspected with stock git tooling.

pub mod blob;
pub mod commit;
pub mod tag;
pub mod tree;

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{object_header, HashAlgorithm, ObjectId};
use crate::repo::Repo;

pub use blob::{is_binary, read_blob, write_blob};
pub use commit::{read_commit, write_commit};
pub use tag::{peel_to_commit, read_tag, write_tag};
pub use tree::{read_tree, write_tree};

/// the four git object kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "commit" => Ok(ObjectKind::Commit),
            "tree" => Ok(ObjectKind::Tree),
            "blob" => Ok(ObjectKind::Blob),
            "tag" => Ok(ObjectKind::Tag),
            other => Err(Error::InvalidObjectType(other.to_string())),
        }
    }
}

/// an object read back from the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

/// handle on an objects directory
///
/// a quarantine store writes into its own directory and falls back to the
/// main store for reads.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    objects: PathBuf,
    tmp: PathBuf,
    algo: HashAlgorithm,
    alternate: Option<PathBuf>,
}

impl ObjectStore {
    /// the main object store of a repository
    pub fn open(repo: &Repo) -> Self {
        Self {
            objects: repo.objects_path(),
            tmp: repo.tmp_path(),
            algo: repo.object_format(),
            alternate: None,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algo
    }

    fn object_path(root: &Path, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.to_path_components();
        root.join(dir).join(file)
    }

    /// locate an object, preferring this store over the alternate
    fn find(&self, id: &ObjectId) -> Option<PathBuf> {
        let own = Self::object_path(&self.objects, id);
        if own.is_file() {
            return Some(own);
        }
        self.alternate
            .as_ref()
            .map(|alt| Self::object_path(alt, id))
            .filter(|p| p.is_file())
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// ids among `candidates` that are not stored
    pub fn walk_missing<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a ObjectId>,
    ) -> BTreeSet<ObjectId> {
        candidates
            .into_iter()
            .filter(|id| !self.has(id))
            .copied()
            .collect()
    }

    /// store an object, returning its id
    ///
    /// an object already present (here or in the alternate) is not rewritten.
    pub fn put(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        let id = self.algo.object_id(kind.as_str(), data);
        if self.has(&id) {
            trace!(%id, "object already stored");
            return Ok(id);
        }

        let path = Self::object_path(&self.objects, &id);
        let dir = path.parent().unwrap_or(&self.objects).to_path_buf();
        fs::create_dir_all(&dir).with_path(&dir)?;
        fs::create_dir_all(&self.tmp).with_path(&self.tmp)?;

        // atomic write: temp -> fsync -> rename
        let tmp_path = self.tmp.join(uuid::Uuid::new_v4().to_string());
        {
            let file = File::create(&tmp_path).with_path(&tmp_path)?;
            let mut encoder = ZlibEncoder::new(file, Compression::default());
            encoder
                .write_all(object_header(kind.as_str(), data.len()).as_bytes())
                .with_path(&tmp_path)?;
            encoder.write_all(data).with_path(&tmp_path)?;
            let file = encoder.finish().with_path(&tmp_path)?;
            file.sync_all().with_path(&tmp_path)?;
        }

        fs::rename(&tmp_path, &path).with_path(&path)?;
        fsync_dir(&dir)?;

        trace!(%id, %kind, size = data.len(), "stored object");
        Ok(id)
    }

    /// read and verify an object
    pub fn get(&self, id: &ObjectId) -> Result<RawObject> {
        let path = self.find(id).ok_or(Error::ObjectNotFound(*id))?;
        let file = File::open(&path).with_path(&path)?;

        let mut raw = Vec::new();
        ZlibDecoder::new(BufReader::new(file))
            .read_to_end(&mut raw)
            .map_err(|e| Error::CorruptObjectMessage(format!("{}: {}", id, e)))?;

        let nul = raw
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::CorruptObjectMessage(format!("{}: missing header", id)))?;
        let (kind, size) = parse_header(id, &raw[..nul])?;
        let data = raw.split_off(nul + 1);
        if data.len() != size {
            return Err(Error::CorruptObjectMessage(format!(
                "{}: header says {} bytes, found {}",
                id,
                size,
                data.len()
            )));
        }

        // verify hash
        if self.algo.object_id(kind.as_str(), &data) != *id {
            return Err(Error::CorruptObject(*id));
        }

        Ok(RawObject { kind, data })
    }

    /// read kind and size without inflating the whole object
    pub fn header(&self, id: &ObjectId) -> Result<(ObjectKind, usize)> {
        let path = self.find(id).ok_or(Error::ObjectNotFound(*id))?;
        let file = File::open(&path).with_path(&path)?;
        let mut decoder = ZlibDecoder::new(BufReader::new(file));

        let mut header = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            let n = decoder
                .read(&mut byte)
                .map_err(|e| Error::CorruptObjectMessage(format!("{}: {}", id, e)))?;
            if n == 0 || header.len() > 64 {
                return Err(Error::CorruptObjectMessage(format!("{}: missing header", id)));
            }
            if byte[0] == 0 {
                break;
            }
            header.push(byte[0]);
        }
        parse_header(id, &header)
    }

    /// read an object, insisting on its kind
    pub fn get_kind(&self, id: &ObjectId, expected: ObjectKind) -> Result<Vec<u8>> {
        let obj = self.get(id)?;
        if obj.kind != expected {
            return Err(Error::WrongKind {
                id: *id,
                found: obj.kind.as_str(),
                expected: expected.as_str(),
            });
        }
        Ok(obj.data)
    }
}

fn parse_header(id: &ObjectId, header: &[u8]) -> Result<(ObjectKind, usize)> {
    let text = std::str::from_utf8(header)
        .map_err(|_| Error::CorruptObjectMessage(format!("{}: header not utf-8", id)))?;
    let (kind, size) = text
        .split_once(' ')
        .ok_or_else(|| Error::CorruptObjectMessage(format!("{}: bad header {}", id, text)))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| Error::CorruptObjectMessage(format!("{}: bad size {}", id, size)))?;
    Ok((kind.parse()?, size))
}

/// fsync a directory so a rename into it is durable
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    let dir_file = File::open(dir).with_path(dir)?;
    dir_file.sync_all().with_path(dir)?;
    Ok(())
}

/// staging area for incoming objects
///
/// objects written here are invisible to the main store until promoted.
/// dropping an unpromoted quarantine removes it.
pub struct Quarantine {
    root: PathBuf,
    store: ObjectStore,
    main: ObjectStore,
    done: bool,
}

impl Quarantine {
    pub fn new(repo: &Repo) -> Result<Self> {
        let root = repo
            .tmp_path()
            .join(format!("incoming-{}", uuid::Uuid::new_v4()));
        let objects = root.join("objects");
        fs::create_dir_all(&objects).with_path(&objects)?;

        let main = ObjectStore::open(repo);
        let store = ObjectStore {
            objects,
            tmp: root.join("tmp"),
            algo: main.algo,
            alternate: Some(main.objects.clone()),
        };
        debug!(path = %root.display(), "opened quarantine");

        Ok(Self {
            root,
            store,
            main,
            done: false,
        })
    }

    /// store reading through to the main store
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// is the object held in quarantine (not yet in the main store)
    pub fn holds(&self, id: &ObjectId) -> bool {
        ObjectStore::object_path(&self.store.objects, id).is_file()
    }

    /// move objects into the main store in the given order
    ///
    /// `order` must list dependencies before dependents so that an
    /// interruption never leaves a stored object with a missing child.
    /// objects not listed are discarded.
    pub fn promote(mut self, order: &[ObjectId]) -> Result<usize> {
        let mut moved = 0;
        for id in order {
            let from = ObjectStore::object_path(&self.store.objects, id);
            if !from.is_file() {
                continue;
            }
            let to = ObjectStore::object_path(&self.main.objects, id);
            if to.is_file() {
                continue;
            }
            let dir = to.parent().unwrap_or(&self.main.objects).to_path_buf();
            fs::create_dir_all(&dir).with_path(&dir)?;
            fs::rename(&from, &to).with_path(&to)?;
            fsync_dir(&dir)?;
            moved += 1;
        }
        debug!(moved, "promoted quarantined objects");

        self.done = true;
        fs::remove_dir_all(&self.root).with_path(&self.root)?;
        Ok(moved)
    }

    /// drop everything received
    pub fn discard(mut self) -> Result<()> {
        self.done = true;
        fs::remove_dir_all(&self.root).with_path(&self.root)
    }
}

impl Drop for Quarantine {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo"), HashAlgorithm::Sha1).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_put_get() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);

        let id = store.put(ObjectKind::Blob, b"hello\n").unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
        assert!(store.has(&id));

        let obj = store.get(&id).unwrap();
        assert_eq!(obj.kind, ObjectKind::Blob);
        assert_eq!(obj.data, b"hello\n");
        assert_eq!(store.header(&id).unwrap(), (ObjectKind::Blob, 6));
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);

        let a = store.put(ObjectKind::Blob, b"same").unwrap();
        let path = ObjectStore::object_path(&repo.objects_path(), &a);
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        let b = store.put(ObjectKind::Blob, b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_get_not_found() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);
        let id = HashAlgorithm::Sha1.object_id("blob", b"absent");
        assert!(matches!(store.get(&id), Err(Error::ObjectNotFound(_))));
    }

    #[test]
    fn test_get_detects_corruption() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);
        let id = store.put(ObjectKind::Blob, b"original").unwrap();

        // overwrite with a valid object of different content
        let other = store.put(ObjectKind::Blob, b"tampered").unwrap();
        let id_path = ObjectStore::object_path(&repo.objects_path(), &id);
        let other_path = ObjectStore::object_path(&repo.objects_path(), &other);
        fs::copy(&other_path, &id_path).unwrap();

        assert!(matches!(store.get(&id), Err(Error::CorruptObject(_))));
    }

    #[test]
    fn test_get_kind_mismatch() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);
        let id = store.put(ObjectKind::Blob, b"x").unwrap();
        let result = store.get_kind(&id, ObjectKind::Tree);
        assert!(matches!(result, Err(Error::WrongKind { .. })));
    }

    #[test]
    fn test_walk_missing() {
        let (_dir, repo) = test_repo();
        let store = ObjectStore::open(&repo);
        let present = store.put(ObjectKind::Blob, b"a").unwrap();
        let absent = HashAlgorithm::Sha1.object_id("blob", b"b");

        let missing = store.walk_missing(&[present, absent]);
        assert_eq!(missing.into_iter().collect::<Vec<_>>(), vec![absent]);
    }

    #[test]
    fn test_quarantine_invisible_until_promoted() {
        let (_dir, repo) = test_repo();
        let main = ObjectStore::open(&repo);
        let existing = main.put(ObjectKind::Blob, b"old").unwrap();

        let q = Quarantine::new(&repo).unwrap();
        let fresh = q.store().put(ObjectKind::Blob, b"new").unwrap();
        let stray = q.store().put(ObjectKind::Blob, b"stray").unwrap();

        // reads fall through to the main store
        assert!(q.store().has(&existing));
        assert!(!q.holds(&existing));
        assert!(!main.has(&fresh));

        assert_eq!(q.promote(&[fresh]).unwrap(), 1);
        assert!(main.has(&fresh));
        assert!(!main.has(&stray));
    }

    #[test]
    fn test_quarantine_dropped_is_removed() {
        let (_dir, repo) = test_repo();
        let root;
        {
            let q = Quarantine::new(&repo).unwrap();
            q.store().put(ObjectKind::Blob, b"lost").unwrap();
            root = q.root.clone();
            assert!(root.exists());
        }
        assert!(!root.exists());
    }
}
