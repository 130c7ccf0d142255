use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::hash::ObjectId;

/// identity and time attached to a commit or tag
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// unix timestamp (seconds since epoch)
    pub time: i64,
    /// timezone offset from UTC in minutes
    pub tz_offset: i32,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            tz_offset: 0,
        }
    }

    /// signature stamped with the current time
    pub fn now(name: impl Into<String>, email: impl Into<String>) -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::new(name, email, time)
    }

    /// parse `Name <email> 1700000000 +0100`
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = || Error::CorruptObjectMessage(format!("bad signature: {}", raw));

        let lt = raw.find('<').ok_or_else(bad)?;
        let gt = raw[lt..].find('>').map(|i| lt + i).ok_or_else(bad)?;
        let name = raw[..lt].trim_end().to_string();
        let email = raw[lt + 1..gt].to_string();

        let mut rest = raw[gt + 1..].split_whitespace();
        let time = rest
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(bad)?;
        let tz_offset = match rest.next() {
            Some(tz) => parse_tz(tz).ok_or_else(bad)?,
            None => 0,
        };

        Ok(Self {
            name,
            email,
            time,
            tz_offset,
        })
    }
}

fn parse_tz(tz: &str) -> Option<i32> {
    if tz.len() != 5 {
        return None;
    }
    let sign = match &tz[..1] {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let hours: i32 = tz[1..3].parse().ok()?;
    let minutes: i32 = tz[3..5].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.tz_offset < 0 { '-' } else { '+' };
        let abs = self.tz_offset.abs();
        write!(
            f,
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.time,
            sign,
            abs / 60,
            abs % 60
        )
    }
}

/// a commit object pointing to a tree with metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    /// root tree id
    pub tree: ObjectId,
    /// parent commit ids (empty for initial, 1 for linear, 2+ for merge)
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// headers this crate does not interpret (`gpgsig`, `encoding`, ...),
    /// kept in order with continuation lines joined by '\n'
    pub extra_headers: Vec<(String, String)>,
    pub message: String,
}

impl Commit {
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parents,
            committer: author.clone(),
            author,
            extra_headers: vec![],
            message: message.into(),
        }
    }

    /// is this an initial commit (no parents)
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// is this a merge commit (multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// first line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let (headers, message) = split_headers(&text);

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key.as_str() {
                "tree" => tree = Some(ObjectId::from_hex(&value)?),
                "parent" => parents.push(ObjectId::from_hex(&value)?),
                "author" => author = Some(Signature::parse(&value)?),
                "committer" => committer = Some(Signature::parse(&value)?),
                _ => extra_headers.push((key, value)),
            }
        }

        let missing = |field: &str| Error::CorruptObjectMessage(format!("commit without {}", field));
        Ok(Self {
            tree: tree.ok_or_else(|| missing("tree"))?,
            parents,
            author: author.ok_or_else(|| missing("author"))?,
            committer: committer.ok_or_else(|| missing("committer"))?,
            extra_headers,
            message,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("tree {}\n", self.tree));
        for parent in &self.parents {
            out.push_str(&format!("parent {}\n", parent));
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("committer {}\n", self.committer));
        write_extra_headers(&mut out, &self.extra_headers);
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }
}

/// split `key value` header lines from the message body
pub(crate) fn split_headers(text: &str) -> (Vec<(String, String)>, String) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut rest = text;

    loop {
        let (line, tail) = match rest.find('\n') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        if line.is_empty() {
            return (headers, tail.to_string());
        }
        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some(last) = headers.last_mut() {
                last.1.push('\n');
                last.1.push_str(continuation);
            }
        } else {
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            headers.push((key.to_string(), value.to_string()));
        }
        if tail.is_empty() {
            return (headers, String::new());
        }
        rest = tail;
    }
}

pub(crate) fn write_extra_headers(out: &mut String, headers: &[(String, String)]) {
    for (key, value) in headers {
        out.push_str(key);
        out.push(' ');
        out.push_str(&value.replace('\n', "\n "));
        out.push('\n');
    }
}
