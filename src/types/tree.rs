use std::cmp::Ordering;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, ObjectId};
use crate::object::ObjectKind;

/// a directory tree - collection of entries in git order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a new tree, validating and sorting entries
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_entry_name(&entry.name)?;
        }

        entries.sort_by(|a, b| a.git_order(b));

        for window in entries.windows(2) {
            if window[0].name == window[1].name {
                return Err(Error::DuplicateEntryName(window[0].name.clone()));
            }
        }

        Ok(Self { entries })
    }

    /// create an empty tree
    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    /// get entries slice
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// look up entry by name
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// is tree empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// decode the binary tree format: repeated `<octal mode> <name>\0<raw id>`
    pub fn parse(data: &[u8], algo: HashAlgorithm) -> Result<Self> {
        let id_len = algo.digest_len();
        let mut entries = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| corrupt("entry without mode separator"))?;
            let mode = EntryMode::parse(&rest[..space])?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| corrupt("entry name not terminated"))?;
            let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
            rest = &rest[nul + 1..];

            if rest.len() < id_len {
                return Err(corrupt("truncated entry id"));
            }
            let id = algo.id_from_bytes(&rest[..id_len])?;
            rest = &rest[id_len..];

            entries.push(TreeEntry { name, mode, id });
        }

        // stored order is trusted; re-sorting would hide corruption
        Ok(Self { entries })
    }

    /// encode to the binary tree format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.as_octal().as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.name.as_bytes());
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }
}

fn corrupt(msg: &str) -> Error {
    Error::CorruptObjectMessage(format!("tree: {}", msg))
}

/// validate an entry name
fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!(
            "name contains '/': {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!(
            "name contains null byte: {}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {}", name)));
    }
    Ok(())
}

/// a single entry in a tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: EntryMode,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: EntryMode, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            id,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.mode == EntryMode::Tree
    }

    /// git sorts directories as if their name ended in '/'
    fn git_order(&self, other: &TreeEntry) -> Ordering {
        let a = self.name.as_bytes();
        let b = other.name.as_bytes();
        let common = a.len().min(b.len());
        match a[..common].cmp(&b[..common]) {
            Ordering::Equal => {}
            other => return other,
        }
        let tail = |bytes: &[u8], entry: &TreeEntry| -> u8 {
            if bytes.len() > common {
                bytes[common]
            } else if entry.is_tree() {
                b'/'
            } else {
                0
            }
        };
        tail(a, self).cmp(&tail(b, other))
    }
}

/// file mode of a tree entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    Regular,
    Executable,
    Symlink,
    Tree,
    /// submodule commit
    Gitlink,
}

impl EntryMode {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        match raw {
            b"100644" | b"100664" | b"100640" => Ok(EntryMode::Regular),
            b"100755" => Ok(EntryMode::Executable),
            b"120000" => Ok(EntryMode::Symlink),
            b"40000" | b"040000" => Ok(EntryMode::Tree),
            b"160000" => Ok(EntryMode::Gitlink),
            other => Err(corrupt(&format!(
                "unknown mode {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// canonical octal form as written in tree objects
    pub fn as_octal(&self) -> &'static str {
        match self {
            EntryMode::Regular => "100644",
            EntryMode::Executable => "100755",
            EntryMode::Symlink => "120000",
            EntryMode::Tree => "40000",
            EntryMode::Gitlink => "160000",
        }
    }

    /// six-digit display form (`040000` for trees)
    pub fn display(&self) -> &'static str {
        match self {
            EntryMode::Tree => "040000",
            other => other.as_octal(),
        }
    }

    /// kind of the object the entry points at
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            EntryMode::Tree => ObjectKind::Tree,
            EntryMode::Gitlink => ObjectKind::Commit,
            _ => ObjectKind::Blob,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::Sha1([byte; 20])
    }

    #[test]
    fn test_tree_sorted_git_order() {
        // "foo" as a directory sorts after "foo.txt" because it compares as "foo/"
        let tree = Tree::new(vec![
            TreeEntry::new("foo", EntryMode::Tree, id(1)),
            TreeEntry::new("foo.txt", EntryMode::Regular, id(2)),
            TreeEntry::new("bar", EntryMode::Regular, id(3)),
        ])
        .unwrap();

        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "foo.txt", "foo"]);
    }

    #[test]
    fn test_tree_rejects_bad_names() {
        for bad in ["", "a/b", ".", "..", "nul\0byte"] {
            let result = Tree::new(vec![TreeEntry::new(bad, EntryMode::Regular, id(1))]);
            assert!(matches!(result, Err(Error::InvalidEntryName(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_tree_rejects_duplicates() {
        let result = Tree::new(vec![
            TreeEntry::new("a", EntryMode::Regular, id(1)),
            TreeEntry::new("a", EntryMode::Regular, id(2)),
        ]);
        assert!(matches!(result, Err(Error::DuplicateEntryName(_))));
    }

    #[test]
    fn test_tree_binary_format() {
        let tree = Tree::new(vec![
            TreeEntry::new("src", EntryMode::Tree, id(0xaa)),
            TreeEntry::new("run.sh", EntryMode::Executable, id(0xbb)),
        ])
        .unwrap();

        let bytes = tree.to_bytes();
        assert!(bytes.starts_with(b"100755 run.sh\0"));

        let parsed = Tree::parse(&bytes, HashAlgorithm::Sha1).unwrap();
        assert_eq!(parsed, tree);
        assert_eq!(parsed.get("src").unwrap().mode, EntryMode::Tree);
    }

    #[test]
    fn test_tree_parse_truncated() {
        let result = Tree::parse(b"100644 file\0short", HashAlgorithm::Sha1);
        assert!(matches!(result, Err(Error::CorruptObjectMessage(_))));
    }

    #[test]
    fn test_empty_tree_id() {
        let id = HashAlgorithm::Sha1.object_id("tree", &Tree::empty().to_bytes());
        assert_eq!(id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }
}
