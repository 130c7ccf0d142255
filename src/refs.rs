use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::object::fsync_dir;
use crate::repo::Repo;

pub const HEADS: &str = "refs/heads/";
pub const TAGS: &str = "refs/tags/";
pub const REMOTES_ORIGIN: &str = "refs/remotes/origin/";

/// limit when following symbolic refs
const MAX_SYMREF_DEPTH: usize = 5;

/// namespace a ref name belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Branch,
    Tag,
    Remote,
    Head,
    Other,
}

impl RefKind {
    pub fn of(name: &str) -> Self {
        if name == "HEAD" {
            RefKind::Head
        } else if name.starts_with(HEADS) {
            RefKind::Branch
        } else if name.starts_with(TAGS) {
            RefKind::Tag
        } else if name.starts_with("refs/remotes/") {
            RefKind::Remote
        } else {
            RefKind::Other
        }
    }
}

/// full name of a local branch
pub fn branch_ref(branch: &str) -> String {
    format!("{}{}", HEADS, branch)
}

/// full name of the tracking ref for a remote branch
pub fn tracking_ref(branch: &str) -> String {
    format!("{}{}", REMOTES_ORIGIN, branch)
}

/// compare-and-swap a ref
///
/// `expected = None` requires the ref to be absent. a concurrent writer
/// holding the ref lock, or a current value other than `expected`, fails
/// with a conflict and leaves the ref untouched.
pub fn update_ref(
    repo: &Repo,
    ref_name: &str,
    new: &ObjectId,
    expected: Option<&ObjectId>,
) -> Result<()> {
    validate_ref_name(ref_name)?;
    let path = ref_path(repo, ref_name);
    let lock = RefLock::acquire(&path, ref_name)?;

    let current = try_read_ref(repo, ref_name)?;
    if current.as_ref() != expected {
        return Err(Error::RefConflict {
            name: ref_name.to_string(),
            expected: describe(expected),
            found: describe(current.as_ref()),
        });
    }

    lock.commit(format!("{}\n", new.to_hex()))?;
    info!(ref_name, old = %describe(current.as_ref()), new = %new, "updated ref");
    Ok(())
}

fn describe(id: Option<&ObjectId>) -> String {
    id.map(|id| id.to_hex())
        .unwrap_or_else(|| "(none)".to_string())
}

/// point a symbolic ref (normally HEAD) at another ref
pub fn write_symbolic(repo: &Repo, name: &str, target: &str) -> Result<()> {
    validate_ref_name(target)?;
    let path = ref_path(repo, name);
    let lock = RefLock::acquire(&path, name)?;
    lock.commit(format!("ref: {}\n", target))?;
    debug!(name, target, "wrote symbolic ref");
    Ok(())
}

/// target of a symbolic ref, None if the ref is direct or absent
pub fn read_symbolic(repo: &Repo, name: &str) -> Result<Option<String>> {
    let path = ref_path(repo, name);
    match fs::read_to_string(&path) {
        Ok(content) => Ok(content
            .trim()
            .strip_prefix("ref: ")
            .map(|t| t.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io { path, source: e }),
    }
}

/// read a ref, following symbolic refs and consulting packed-refs
pub fn read_ref(repo: &Repo, ref_name: &str) -> Result<ObjectId> {
    try_read_ref(repo, ref_name)?.ok_or_else(|| Error::RefNotFound(ref_name.to_string()))
}

/// read a ref, returning None when it does not exist
pub fn try_read_ref(repo: &Repo, ref_name: &str) -> Result<Option<ObjectId>> {
    let mut name = ref_name.to_string();
    for _ in 0..MAX_SYMREF_DEPTH {
        let path = ref_path(repo, &name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(read_packed_refs(repo)?.remove(&name));
            }
            // a directory of the same name means this is a namespace, not a ref
            Err(_) if path.is_dir() => return Ok(None),
            Err(e) => return Err(Error::Io { path, source: e }),
        };

        let content = content.trim();
        match content.strip_prefix("ref: ") {
            Some(target) => name = target.trim().to_string(),
            None => return ObjectId::from_hex(content).map(Some),
        }
    }
    Err(Error::InvalidRef(format!(
        "symbolic ref chain too deep: {}",
        ref_name
    )))
}

/// delete a ref, only if it still holds `expected`
pub fn delete_ref(repo: &Repo, ref_name: &str, expected: &ObjectId) -> Result<()> {
    validate_ref_name(ref_name)?;
    let path = ref_path(repo, ref_name);
    let lock = RefLock::acquire(&path, ref_name)?;

    match try_read_ref(repo, ref_name)? {
        None => return Err(Error::RefNotFound(ref_name.to_string())),
        Some(current) if current != *expected => {
            return Err(Error::RefConflict {
                name: ref_name.to_string(),
                expected: expected.to_hex(),
                found: current.to_hex(),
            })
        }
        Some(_) => {}
    }

    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Io { path, source: e }),
    }
    drop(lock);
    Ok(())
}

/// check if a ref exists
pub fn ref_exists(repo: &Repo, ref_name: &str) -> bool {
    matches!(try_read_ref(repo, ref_name), Ok(Some(_)))
}

/// list refs under a prefix (e.g. "refs/heads/"), loose refs shadowing packed
pub fn list_refs(repo: &Repo, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
    let mut refs: BTreeMap<String, ObjectId> = read_packed_refs(repo)?
        .into_iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .collect();

    let refs_dir = repo.refs_path();
    if refs_dir.exists() {
        for entry in walkdir::WalkDir::new(&refs_dir) {
            let entry = entry.map_err(|e| Error::Io {
                path: refs_dir.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(repo.path()) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if rel.ends_with(".lock") || !rel.starts_with(prefix) {
                continue;
            }
            if let Some(id) = try_read_ref(repo, &rel)? {
                refs.insert(rel, id);
            }
        }
    }

    Ok(refs.into_iter().collect())
}

/// resolve a user-supplied revision to a commit-ish id
///
/// tries a local branch, the origin tracking branch, a tag, a full ref name,
/// then a full-length hex id.
pub fn resolve(repo: &Repo, name: &str) -> Result<ObjectId> {
    let candidates = [
        branch_ref(name),
        tracking_ref(name),
        format!("{}{}", TAGS, name),
        name.to_string(),
    ];
    for candidate in &candidates {
        if validate_ref_name(candidate).is_err() {
            continue;
        }
        if let Some(id) = try_read_ref(repo, candidate)? {
            return Ok(id);
        }
    }

    if name.len() == repo.object_format().hex_len() && name.chars().all(|c| c.is_ascii_hexdigit())
    {
        return ObjectId::from_hex(name);
    }

    Err(Error::RefNotFound(name.to_string()))
}

/// parse `packed-refs`, skipping peel lines
fn read_packed_refs(repo: &Repo) -> Result<BTreeMap<String, ObjectId>> {
    let path = repo.path().join("packed-refs");
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(Error::Io { path, source: e }),
    };

    let mut refs = BTreeMap::new();
    for line in content.lines() {
        if line.starts_with('#') || line.starts_with('^') || line.is_empty() {
            continue;
        }
        if let Some((hex, name)) = line.split_once(' ') {
            refs.insert(name.trim().to_string(), ObjectId::from_hex(hex)?);
        }
    }
    Ok(refs)
}

/// get filesystem path for a ref
fn ref_path(repo: &Repo, ref_name: &str) -> PathBuf {
    repo.path().join(ref_name)
}

/// exclusive `<ref>.lock` file; removed on drop unless committed
struct RefLock {
    lock_path: PathBuf,
    target: PathBuf,
    file: Option<File>,
}

impl RefLock {
    fn acquire(target: &Path, ref_name: &str) -> Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let mut lock_path = target.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::RefLocked(ref_name.to_string())
                } else {
                    Error::Io {
                        path: lock_path.clone(),
                        source: e,
                    }
                }
            })?;

        Ok(Self {
            lock_path,
            target: target.to_path_buf(),
            file: Some(file),
        })
    }

    /// write the new content and rename the lock over the ref
    fn commit(mut self, content: String) -> Result<()> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        let written = file
            .write_all(content.as_bytes())
            .and_then(|_| file.sync_all())
            .and_then(|_| fs::rename(&self.lock_path, &self.target));
        if let Err(source) = written {
            let _ = fs::remove_file(&self.lock_path);
            return Err(Error::Io {
                path: self.target.clone(),
                source,
            });
        }
        if let Some(parent) = self.target.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }
}

impl Drop for RefLock {
    fn drop(&mut self) {
        // once committed the lock path may already belong to the next writer
        if self.file.is_some() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// validate ref name (subset of git check-ref-format)
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(Error::InvalidRef(format!(
            "ref name cannot start or end with '/': {}",
            name
        )));
    }

    if name.contains("//") || name.contains("..") || name.contains("@{") {
        return Err(Error::InvalidRef(format!(
            "ref name contains a forbidden sequence: {}",
            name
        )));
    }

    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(Error::InvalidRef(format!(
            "ref name contains a forbidden character: {:?}",
            name
        )));
    }

    for component in name.split('/') {
        if component.starts_with('.') || component.ends_with(".lock") {
            return Err(Error::InvalidRef(format!(
                "invalid ref name component '{}' in {}",
                component, name
            )));
        }
    }

    Ok(())
}
