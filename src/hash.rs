use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// digest algorithm of a repository (git `extensions.objectformat`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// raw digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// hex digest length
    pub fn hex_len(&self) -> usize {
        self.digest_len() * 2
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// id made of zero bytes, used by the wire protocol for "no object"
    pub fn null_id(&self) -> ObjectId {
        match self {
            HashAlgorithm::Sha1 => ObjectId::Sha1([0u8; 20]),
            HashAlgorithm::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// id of an object given its kind name and content
    pub fn object_id(&self, kind: &str, content: &[u8]) -> ObjectId {
        let mut hasher = self.hasher();
        hasher.update(object_header(kind, content.len()).as_bytes());
        hasher.update(content);
        hasher.finalize()
    }

    /// parse a raw digest of this algorithm's length
    pub fn id_from_bytes(&self, bytes: &[u8]) -> crate::Result<ObjectId> {
        if bytes.len() != self.digest_len() {
            return Err(Error::InvalidHashHex(hex::encode(bytes)));
        }
        Ok(match self {
            HashAlgorithm::Sha1 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                ObjectId::Sha1(arr)
            }
            HashAlgorithm::Sha256 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                ObjectId::Sha256(arr)
            }
        })
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(Error::Unsupported(format!("object format {}", other))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// canonical object header: `"<kind> <len>\0"`
pub fn object_header(kind: &str, len: usize) -> String {
    format!("{} {}\0", kind, len)
}

/// incremental digest for either algorithm
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> ObjectId {
        match self {
            Hasher::Sha1(h) => ObjectId::Sha1(h.finalize().into()),
            Hasher::Sha256(h) => ObjectId::Sha256(h.finalize().into()),
        }
    }
}

/// content address of a git object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl ObjectId {
    /// parse from hex string, picking the algorithm by length
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidHashHex(s.to_string()))?;
        match bytes.len() {
            20 => HashAlgorithm::Sha1.id_from_bytes(&bytes),
            32 => HashAlgorithm::Sha256.id_from_bytes(&bytes),
            _ => Err(Error::InvalidHashHex(s.to_string())),
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            ObjectId::Sha1(_) => HashAlgorithm::Sha1,
            ObjectId::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ObjectId::Sha1(b) => b,
            ObjectId::Sha256(b) => b,
        }
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// abbreviated hex form, 7 chars like `git log --oneline`
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }

    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// split into path components for object store
    /// returns (first 2 hex chars, remaining hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..12])
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
