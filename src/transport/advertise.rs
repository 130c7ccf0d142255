//! reading the upload-pack ref advertisement

use std::io::Read;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, ErrorKind, Result};
use crate::hash::{HashAlgorithm, ObjectId};
use crate::refs::{RefKind, HEADS, TAGS};
use crate::transport::pktline::{read_pkt, write_flush, PktLine};
use crate::transport::ssh::classify_stderr;
use crate::transport::{Connection, RemoteDescriptor};

/// a ref as the remote reports it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteRef {
    pub name: String,
    pub id: ObjectId,
    /// commit an annotated tag points at
    pub peeled: Option<ObjectId>,
    pub kind: RefKind,
}

impl RemoteRef {
    /// name without the `refs/heads/` or `refs/tags/` prefix
    pub fn short_name(&self) -> &str {
        self.name
            .strip_prefix(HEADS)
            .or_else(|| self.name.strip_prefix(TAGS))
            .unwrap_or(&self.name)
    }
}

/// everything the remote announced before negotiation
#[derive(Clone, Debug, Default)]
pub struct Advertisement {
    /// refs in advertisement order
    pub refs: Vec<RemoteRef>,
    pub capabilities: Vec<String>,
    /// target of the remote HEAD, from the `symref` capability
    pub head: Option<String>,
    pub object_format: HashAlgorithm,
}

impl Advertisement {
    /// parse an advertisement up to and including its flush packet
    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut adv = Advertisement::default();
        let mut first = true;

        loop {
            let pkt = match read_pkt(reader)? {
                Some(pkt) => pkt,
                None if first => {
                    return Err(Error::Network(
                        "remote closed the connection before advertising refs".to_string(),
                    ))
                }
                None => return Err(Error::Network("truncated ref advertisement".to_string())),
            };
            let data = match pkt {
                PktLine::Flush => break,
                PktLine::Data(data) => data,
                _ => continue,
            };

            let line = String::from_utf8_lossy(&data);
            let line = line.strip_suffix('\n').unwrap_or(&line);
            if let Some(message) = line.strip_prefix("ERR ") {
                return Err(classify_stderr(message)
                    .unwrap_or_else(|| Error::Remote(message.to_string())));
            }
            if first && line.starts_with("version ") {
                if line != "version 1" {
                    return Err(Error::Unsupported(format!("protocol {}", line)));
                }
                continue;
            }

            let line = if first {
                first = false;
                match line.split_once('\0') {
                    Some((refline, caps)) => {
                        adv.set_capabilities(caps)?;
                        refline.to_string()
                    }
                    None => line.to_string(),
                }
            } else {
                line.to_string()
            };
            adv.push_line(&line)?;
        }

        debug!(
            refs = adv.refs.len(),
            head = adv.head.as_deref().unwrap_or("-"),
            "read advertisement"
        );
        Ok(adv)
    }

    fn set_capabilities(&mut self, caps: &str) -> Result<()> {
        self.capabilities = caps.split_whitespace().map(str::to_string).collect();
        for cap in &self.capabilities {
            if let Some(target) = cap.strip_prefix("symref=HEAD:") {
                self.head = Some(target.to_string());
            } else if let Some(format) = cap.strip_prefix("object-format=") {
                self.object_format = format.parse()?;
            }
        }
        Ok(())
    }

    fn push_line(&mut self, line: &str) -> Result<()> {
        let (hex, name) = line
            .split_once(' ')
            .ok_or_else(|| Error::Protocol(format!("malformed ref line {:?}", line)))?;
        let id = ObjectId::from_hex(hex)?;
        if name == "capabilities^{}" {
            return Ok(());
        }
        if let Some(base) = name.strip_suffix("^{}") {
            if let Some(tag) = self.refs.iter_mut().rev().find(|r| r.name == base) {
                tag.peeled = Some(id);
            }
            return Ok(());
        }
        self.refs.push(RemoteRef {
            name: name.to_string(),
            id,
            peeled: None,
            kind: RefKind::of(name),
        });
        Ok(())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == name || c.split_once('=').is_some_and(|(k, _)| k == name))
    }

    pub fn branches(&self) -> impl Iterator<Item = &RemoteRef> {
        self.refs.iter().filter(|r| r.kind == RefKind::Branch)
    }

    pub fn tags(&self) -> impl Iterator<Item = &RemoteRef> {
        self.refs.iter().filter(|r| r.kind == RefKind::Tag)
    }

    /// `refs/heads/<name>` if advertised
    pub fn branch(&self, name: &str) -> Option<&RemoteRef> {
        self.branches().find(|r| r.short_name() == name)
    }

    /// branch a fresh clone checks out
    ///
    /// the HEAD symref when it names an advertised branch, then `main`,
    /// `master`, then the first branch.
    pub fn default_branch(&self) -> Option<&RemoteRef> {
        self.head
            .as_deref()
            .and_then(|target| self.branches().find(|r| r.name == target))
            .or_else(|| self.branch("main"))
            .or_else(|| self.branch("master"))
            .or_else(|| self.branches().next())
    }
}

/// list a remote's refs without fetching anything
///
/// network failures are retried `settings.list_retries` times with doubling
/// backoff; nothing is written locally.
pub fn list_remote_refs(remote: &RemoteDescriptor, settings: &Settings) -> Result<Advertisement> {
    let mut attempt = 0;
    loop {
        match list_once(remote, settings) {
            Ok(adv) => return Ok(adv),
            Err(e) if e.kind() == ErrorKind::NetworkFailure && attempt < settings.list_retries => {
                let delay = settings.retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                warn!(remote = %remote, attempt = attempt + 1, error = %e, "listing refs failed, retrying");
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn list_once(remote: &RemoteDescriptor, settings: &Settings) -> Result<Advertisement> {
    let mut conn = Connection::open(remote, settings)?;
    let adv = match Advertisement::read(conn.reader()) {
        Ok(adv) => adv,
        Err(e) => return Err(conn.explain(e)),
    };
    // tell upload-pack we want nothing
    let _ = write_flush(conn.writer());
    conn.finish();
    Ok(adv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pktline::write_text;
    use std::io::Cursor;

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";
    const C: &str = "3333333333333333333333333333333333333333";

    fn wire(lines: &[&str]) -> Cursor<Vec<u8>> {
        let mut out = Vec::new();
        for line in lines {
            write_text(&mut out, line).unwrap();
        }
        write_flush(&mut out).unwrap();
        Cursor::new(out)
    }

    #[test]
    fn test_parse_advertisement() {
        let first = format!(
            "{} HEAD\0multi_ack side-band-64k ofs-delta symref=HEAD:refs/heads/dev agent=git/2.43",
            A
        );
        let mut input = wire(&[
            &first,
            &format!("{} refs/heads/dev", A),
            &format!("{} refs/heads/main", B),
            &format!("{} refs/tags/v1", C),
            &format!("{} refs/tags/v1^{{}}", B),
        ]);
        let adv = Advertisement::read(&mut input).unwrap();

        assert_eq!(adv.refs.len(), 4);
        assert_eq!(adv.head.as_deref(), Some("refs/heads/dev"));
        assert!(adv.has_capability("side-band-64k"));
        assert!(adv.has_capability("symref"));
        assert!(!adv.has_capability("shallow"));
        assert_eq!(adv.object_format, HashAlgorithm::Sha1);

        assert_eq!(adv.default_branch().unwrap().short_name(), "dev");
        let tag = adv.tags().next().unwrap();
        assert_eq!(tag.short_name(), "v1");
        assert_eq!(tag.peeled.unwrap().to_hex(), B);
        assert_eq!(adv.branches().count(), 2);
    }

    #[test]
    fn test_empty_remote() {
        let mut input = wire(&[&format!("{} capabilities^{{}}\0agent=git/2", "0".repeat(40))]);
        let adv = Advertisement::read(&mut input).unwrap();
        assert!(adv.refs.is_empty());
        assert!(adv.default_branch().is_none());
    }

    #[test]
    fn test_default_branch_fallbacks() {
        let mut input = wire(&[
            &format!("{} refs/heads/feature\0ofs-delta", A),
            &format!("{} refs/heads/master", B),
        ]);
        let adv = Advertisement::read(&mut input).unwrap();
        assert_eq!(adv.default_branch().unwrap().short_name(), "master");
    }

    #[test]
    fn test_err_line() {
        let mut input = wire(&["ERR Repository not found."]);
        let err = Advertisement::read(&mut input).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_closed_before_advertisement() {
        let err = Advertisement::read(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    }

    #[test]
    fn test_sha256_object_format() {
        let id = "a".repeat(64);
        let mut input = wire(&[&format!("{} refs/heads/main\0object-format=sha256", id)]);
        let adv = Advertisement::read(&mut input).unwrap();
        assert_eq!(adv.object_format, HashAlgorithm::Sha256);
        assert_eq!(adv.refs[0].id.algorithm(), HashAlgorithm::Sha256);
    }
}
