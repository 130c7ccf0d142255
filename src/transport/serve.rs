//! server side of the fetch protocol
//!
//! a minimal `git-upload-pack`: ref advertisement, want/have negotiation
//! with optional `multi_ack`, and a pack of whole objects. it serves local remotes
//! in-process and ssh clients through `higit upload-pack <dir>`.

use std::collections::HashSet;
use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::identity::{parse_authorized_keys, public_key_from_blob, verify};
use crate::object::{peel_to_commit, ObjectKind, ObjectStore};
use crate::ops::connectivity::reachable;
use crate::pack::write_pack;
use crate::refs::{list_refs, read_symbolic, try_read_ref};
use crate::repo::Repo;
use crate::transport::pktline::{expect_pkt, read_pkt, wire_error, write_band, write_flush, write_text, PktLine};
use crate::transport::AGENT;

/// file in a served repository listing the keys allowed to fetch
pub const AUTHORIZED_KEYS: &str = "authorized_keys";

const CHALLENGE_CONTEXT: &[u8] = b"higit-upload-pack-auth\0";

/// bytes a client signs to answer a challenge
pub(crate) fn challenge_message(nonce: &[u8]) -> Vec<u8> {
    let mut message = CHALLENGE_CONTEXT.to_vec();
    message.extend_from_slice(nonce);
    message
}

#[derive(Clone, Debug, Default)]
pub struct ServeOptions {
    /// start with the in-process authentication preamble
    pub handshake: bool,
    /// keys accepted by the preamble; None lets everyone in
    pub authorized_keys: Option<Vec<VerifyingKey>>,
}

impl ServeOptions {
    /// plain upload-pack, authentication left to ssh
    pub fn plain() -> Self {
        Self::default()
    }

    /// in-process serving, honouring the repository's authorized_keys file
    pub fn for_local(repo: &Repo) -> Result<Self> {
        let path = repo.path().join(AUTHORIZED_KEYS);
        let authorized_keys = if path.is_file() {
            let text = std::fs::read_to_string(&path).with_path(&path)?;
            Some(parse_authorized_keys(&text))
        } else {
            None
        };
        Ok(Self {
            handshake: true,
            authorized_keys,
        })
    }
}

/// a ref as advertised: name, id and peeled commit for annotated tags
struct Advertised {
    name: String,
    id: ObjectId,
    peeled: Option<ObjectId>,
}

/// serve one upload-pack session
pub fn upload_pack<R: Read, W: Write>(
    repo: &Repo,
    input: &mut R,
    output: &mut W,
    options: &ServeOptions,
) -> Result<()> {
    if options.handshake {
        authenticate(input, output, options)?;
    }

    let store = ObjectStore::open(repo);
    let refs = advertised_refs(repo, &store)?;
    write_advertisement(repo, output, &refs)?;

    let Some((wants, capabilities)) = read_wants(input)? else {
        debug!("client closed after advertisement");
        return Ok(());
    };
    let sideband = capabilities
        .iter()
        .any(|c| c == "side-band-64k" || c == "side-band");
    let multi_ack = capabilities.iter().any(|c| c == "multi_ack");

    let advertised: HashSet<ObjectId> = refs
        .iter()
        .flat_map(|r| std::iter::once(r.id).chain(r.peeled))
        .collect();
    if let Some(bad) = wants.iter().find(|id| !advertised.contains(id)) {
        let message = format!("upload-pack: not our ref {}", bad);
        write_text(output, &format!("ERR {}", message))?;
        write_flush(output)?;
        return Err(Error::Protocol(message));
    }

    let Some(common) = negotiate(input, output, &store, multi_ack)? else {
        debug!("client closed during negotiation");
        return Ok(());
    };

    match send_pack(output, &store, &wants, &common, sideband) {
        Ok(count) => {
            info!(objects = count, wants = wants.len(), "served pack");
            Ok(())
        }
        Err(e) => {
            if sideband {
                let _ = write_band(output, 3, format!("{}\n", e).as_bytes());
                let _ = write_flush(output);
            }
            Err(e)
        }
    }
}

fn authenticate<R: Read, W: Write>(input: &mut R, output: &mut W, options: &ServeOptions) -> Result<()> {
    let Some(keys) = &options.authorized_keys else {
        write_text(output, "auth-none")?;
        return output.flush().map_err(wire_error);
    };

    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    write_text(output, &format!("auth-challenge {}", hex::encode(nonce)))?;
    output.flush().map_err(wire_error)?;

    let pkt = expect_pkt(input)?;
    let response = pkt
        .as_text()
        .and_then(|l| l.strip_prefix("auth-response "))
        .ok_or_else(|| Error::Protocol("expected auth-response".to_string()))?;

    let accepted = response.split_once(' ').is_some_and(|(key, sig)| {
        let key = STANDARD
            .decode(key)
            .ok()
            .and_then(|blob| public_key_from_blob(&blob).ok());
        let sig = STANDARD.decode(sig).ok();
        match (key, sig) {
            (Some(key), Some(sig)) => {
                keys.contains(&key) && verify(&key, &challenge_message(&nonce), &sig)
            }
            _ => false,
        }
    });
    if !accepted {
        write_text(output, "ERR Permission denied (publickey): key is not authorized")?;
        write_flush(output)?;
        return Err(Error::Authentication(
            "key is not authorized for this repository".to_string(),
        ));
    }
    debug!("client key accepted");
    Ok(())
}

fn advertised_refs(repo: &Repo, store: &ObjectStore) -> Result<Vec<Advertised>> {
    let mut refs = Vec::new();
    if let Some(id) = try_read_ref(repo, "HEAD")? {
        refs.push(Advertised {
            name: "HEAD".to_string(),
            id,
            peeled: None,
        });
    }
    for (name, id) in list_refs(repo, "refs/")? {
        let peeled = match store.header(&id) {
            Ok((ObjectKind::Tag, _)) => peel_to_commit(store, &id).ok(),
            _ => None,
        };
        refs.push(Advertised { name, id, peeled });
    }
    Ok(refs)
}

fn write_advertisement<W: Write>(repo: &Repo, output: &mut W, refs: &[Advertised]) -> Result<()> {
    let mut caps = vec![
        "multi_ack".to_string(),
        "side-band-64k".to_string(),
        "side-band".to_string(),
        "ofs-delta".to_string(),
    ];
    if refs.first().is_some_and(|r| r.name == "HEAD") {
        if let Some(target) = read_symbolic(repo, "HEAD")? {
            caps.push(format!("symref=HEAD:{}", target));
        }
    }
    caps.push(format!("object-format={}", repo.object_format().name()));
    caps.push(format!("agent={}", AGENT));
    let caps = caps.join(" ");

    match refs.first() {
        None => {
            let null = repo.object_format().null_id();
            write_first_line(output, &format!("{} capabilities^{{}}", null), &caps)?;
        }
        Some(first) => {
            write_first_line(output, &format!("{} {}", first.id, first.name), &caps)?;
            if let Some(peeled) = first.peeled {
                write_text(output, &format!("{} {}^{{}}", peeled, first.name))?;
            }
        }
    }
    for r in refs.iter().skip(1) {
        write_text(output, &format!("{} {}", r.id, r.name))?;
        if let Some(peeled) = r.peeled {
            write_text(output, &format!("{} {}^{{}}", peeled, r.name))?;
        }
    }
    write_flush(output)
}

/// first advertisement line carries capabilities after a NUL
fn write_first_line<W: Write>(output: &mut W, line: &str, caps: &str) -> Result<()> {
    write_text(output, &format!("{}\0{}", line, caps))
}

/// wanted ids and client capabilities; None if the client only listed refs
fn read_wants<R: Read>(input: &mut R) -> Result<Option<(Vec<ObjectId>, Vec<String>)>> {
    let mut wants = Vec::new();
    let mut caps = Vec::new();
    loop {
        let pkt = match read_pkt(input)? {
            None => return Ok(None),
            Some(PktLine::Flush) => break,
            Some(pkt) => pkt,
        };
        let line = pkt
            .as_text()
            .ok_or_else(|| Error::Protocol("non-text want line".to_string()))?;
        if line.starts_with("shallow ") || line.starts_with("deepen") {
            return Err(Error::Unsupported("shallow fetch".to_string()));
        }
        let rest = line
            .strip_prefix("want ")
            .ok_or_else(|| Error::Protocol(format!("expected want, got {:?}", line)))?;
        let mut parts = rest.split(' ');
        let id = ObjectId::from_hex(parts.next().unwrap_or_default())?;
        if wants.is_empty() {
            caps.extend(parts.map(str::to_string));
        }
        wants.push(id);
    }
    if wants.is_empty() {
        return Ok(None);
    }
    Ok(Some((wants, caps)))
}

/// read haves until `done`
///
/// without `multi_ack` only the first common commit is acknowledged. with it,
/// each batch of haves is answered by `ACK <id> continue` per common commit
/// and a closing `NAK`, and `done` by a final `ACK` of the last common one.
fn negotiate<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    store: &ObjectStore,
    multi_ack: bool,
) -> Result<Option<Vec<ObjectId>>> {
    let mut common = Vec::new();
    let mut batch = Vec::new();
    loop {
        let Some(pkt) = read_pkt(input)? else {
            return Ok(None);
        };
        match pkt {
            PktLine::Flush => {
                for id in batch.drain(..) {
                    write_text(output, &format!("ACK {} continue", id))?;
                }
                if multi_ack || common.is_empty() {
                    write_text(output, "NAK")?;
                }
                output.flush().map_err(wire_error)?;
            }
            pkt => {
                let line = pkt
                    .as_text()
                    .ok_or_else(|| Error::Protocol("non-text negotiation line".to_string()))?;
                if line == "done" {
                    break;
                }
                let hex = line
                    .strip_prefix("have ")
                    .ok_or_else(|| Error::Protocol(format!("expected have, got {:?}", line)))?;
                let id = ObjectId::from_hex(hex)?;
                if !store.has(&id) {
                    continue;
                }
                if multi_ack {
                    batch.push(id);
                } else if common.is_empty() {
                    write_text(output, &format!("ACK {}", id))?;
                    output.flush().map_err(wire_error)?;
                }
                common.push(id);
            }
        }
    }

    for id in batch.drain(..) {
        write_text(output, &format!("ACK {} continue", id))?;
    }
    match common.last() {
        Some(last) if multi_ack => write_text(output, &format!("ACK {}", last))?,
        Some(_) => {}
        None => write_text(output, "NAK")?,
    }
    output.flush().map_err(wire_error)?;
    Ok(Some(common))
}

/// forwards writes as band-1 packets
struct SidebandWriter<'w, W: Write> {
    inner: &'w mut W,
}

impl<W: Write> Write for SidebandWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_band(self.inner, 1, buf).map_err(|e| io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn send_pack<W: Write>(
    output: &mut W,
    store: &ObjectStore,
    wants: &[ObjectId],
    common: &[ObjectId],
    sideband: bool,
) -> Result<usize> {
    let exclude: HashSet<ObjectId> = reachable(store, common, &HashSet::new())?
        .into_iter()
        .collect();
    let objects = reachable(store, wants, &exclude)?;
    let count = u32::try_from(objects.len())
        .map_err(|_| Error::Unsupported("pack with more than 2^32 objects".to_string()))?;

    let entries = objects.iter().map(|id| store.get(id));
    if sideband {
        write_band(
            output,
            2,
            format!("Enumerating objects: {}, done.\n", count).as_bytes(),
        )?;
        write_pack(SidebandWriter { inner: &mut *output }, store.algorithm(), entries, count)?;
        write_band(output, 2, format!("Total {} (delta 0)\n", count).as_bytes())?;
        write_flush(output)?;
    } else {
        write_pack(&mut *output, store.algorithm(), entries, count)?;
    }
    Ok(objects.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::object::{write_blob, write_commit, write_tree};
    use crate::refs::{branch_ref, update_ref, write_symbolic};
    use crate::types::{Commit, EntryMode, Signature, Tree, TreeEntry};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn served_repo(dir: &std::path::Path) -> (Repo, ObjectId) {
        let repo = Repo::init(&dir.join("served"), HashAlgorithm::Sha1).unwrap();
        let store = ObjectStore::open(&repo);
        let blob = write_blob(&store, b"hello\n").unwrap();
        let tree = write_tree(
            &store,
            &Tree::new(vec![TreeEntry::new("hello.txt", EntryMode::Regular, blob)]).unwrap(),
        )
        .unwrap();
        let commit = Commit::new(tree, vec![], Signature::new("a", "a@x", 100), "init\n");
        let id = write_commit(&store, &commit).unwrap();
        update_ref(&repo, &branch_ref("main"), &id, None).unwrap();
        write_symbolic(&repo, "HEAD", "refs/heads/main").unwrap();
        (repo, id)
    }

    fn lines(wire: &[u8]) -> Vec<PktLine> {
        let mut cursor = Cursor::new(wire.to_vec());
        let mut out = Vec::new();
        while let Some(pkt) = read_pkt(&mut cursor).unwrap() {
            out.push(pkt);
        }
        out
    }

    #[test]
    fn test_advertisement_only() {
        let dir = tempdir().unwrap();
        let (repo, id) = served_repo(dir.path());

        let mut input = Cursor::new(b"0000".to_vec());
        let mut output = Vec::new();
        upload_pack(&repo, &mut input, &mut output, &ServeOptions::plain()).unwrap();

        let pkts = lines(&output);
        let first = pkts[0].as_text().unwrap();
        assert!(first.starts_with(&format!("{} HEAD\0", id)));
        assert!(first.contains("symref=HEAD:refs/heads/main"));
        assert!(first.contains("object-format=sha1"));
        assert_eq!(pkts[1].as_text(), Some(format!("{} refs/heads/main", id).as_str()));
        assert_eq!(pkts[2], PktLine::Flush);
    }

    #[test]
    fn test_empty_repo_advertises_capabilities() {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("empty"), HashAlgorithm::Sha1).unwrap();

        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        upload_pack(&repo, &mut input, &mut output, &ServeOptions::plain()).unwrap();

        let pkts = lines(&output);
        let first = pkts[0].as_text().unwrap();
        assert!(first.starts_with(&format!("{} capabilities^{{}}\0", "0".repeat(40))));
    }

    #[test]
    fn test_full_pack_without_sideband() {
        let dir = tempdir().unwrap();
        let (repo, id) = served_repo(dir.path());

        let mut request = Vec::new();
        write_text(&mut request, &format!("want {} ofs-delta", id)).unwrap();
        write_flush(&mut request).unwrap();
        write_text(&mut request, "done").unwrap();

        let mut output = Vec::new();
        upload_pack(&repo, &mut Cursor::new(request), &mut output, &ServeOptions::plain()).unwrap();

        let pack_at = output.windows(4).position(|w| w == b"PACK").unwrap();
        // commit, tree and blob
        assert_eq!(&output[pack_at + 8..pack_at + 12], &[0, 0, 0, 3]);
        let nak = output[..pack_at].windows(3).any(|w| w == b"NAK");
        assert!(nak);
    }

    #[test]
    fn test_rejects_unadvertised_want() {
        let dir = tempdir().unwrap();
        let (repo, _) = served_repo(dir.path());
        let stranger = HashAlgorithm::Sha1.object_id("blob", b"elsewhere");

        let mut request = Vec::new();
        write_text(&mut request, &format!("want {}", stranger)).unwrap();
        write_flush(&mut request).unwrap();

        let mut output = Vec::new();
        let result = upload_pack(&repo, &mut Cursor::new(request), &mut output, &ServeOptions::plain());
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(String::from_utf8_lossy(&output).contains("ERR upload-pack: not our ref"));
    }

    #[test]
    fn test_challenge_rejects_anonymous() {
        let dir = tempdir().unwrap();
        let (repo, _) = served_repo(dir.path());
        let options = ServeOptions {
            handshake: true,
            authorized_keys: Some(vec![]),
        };

        let mut request = Vec::new();
        write_text(&mut request, "auth-response none").unwrap();

        let mut output = Vec::new();
        let result = upload_pack(&repo, &mut Cursor::new(request), &mut output, &options);
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert!(String::from_utf8_lossy(&output).contains("Permission denied"));
    }

    #[test]
    fn test_multi_ack_acknowledges_every_common_have() {
        let dir = tempdir().unwrap();
        let (repo, first) = served_repo(dir.path());
        let store = ObjectStore::open(&repo);
        let mut tips = vec![first];
        for (t, content) in [(200, "two"), (300, "three")] {
            let blob = write_blob(&store, content.as_bytes()).unwrap();
            let tree = write_tree(
                &store,
                &Tree::new(vec![TreeEntry::new("hello.txt", EntryMode::Regular, blob)]).unwrap(),
            )
            .unwrap();
            let parent = *tips.last().unwrap();
            let commit = Commit::new(tree, vec![parent], Signature::new("a", "a@x", t), "more\n");
            let id = write_commit(&store, &commit).unwrap();
            update_ref(&repo, &branch_ref("main"), &id, Some(&parent)).unwrap();
            tips.push(id);
        }
        let unknown = HashAlgorithm::Sha1.object_id("commit", b"not here");

        let mut request = Vec::new();
        write_text(&mut request, &format!("want {} multi_ack side-band-64k", tips[2])).unwrap();
        write_flush(&mut request).unwrap();
        write_text(&mut request, &format!("have {}", tips[1])).unwrap();
        write_text(&mut request, &format!("have {}", unknown)).unwrap();
        write_text(&mut request, &format!("have {}", tips[0])).unwrap();
        write_text(&mut request, "done").unwrap();

        let mut output = Vec::new();
        upload_pack(&repo, &mut Cursor::new(request), &mut output, &ServeOptions::plain()).unwrap();

        let replies: Vec<String> = lines(&output)
            .iter()
            .filter_map(|p| p.as_text())
            .filter(|l| l.starts_with("ACK") || l.starts_with("NAK"))
            .map(str::to_string)
            .collect();
        assert_eq!(
            replies,
            vec![
                format!("ACK {} continue", tips[1]),
                format!("ACK {} continue", tips[0]),
                format!("ACK {}", tips[0]),
            ]
        );
    }

    #[test]
    fn test_single_ack_without_multi_ack() {
        let dir = tempdir().unwrap();
        let (repo, id) = served_repo(dir.path());

        let mut request = Vec::new();
        write_text(&mut request, &format!("want {} side-band-64k", id)).unwrap();
        write_flush(&mut request).unwrap();
        write_text(&mut request, &format!("have {}", id)).unwrap();
        write_text(&mut request, "done").unwrap();

        let mut output = Vec::new();
        upload_pack(&repo, &mut Cursor::new(request), &mut output, &ServeOptions::plain()).unwrap();

        let acks = lines(&output)
            .iter()
            .filter(|p| p.as_text().is_some_and(|l| l.starts_with("ACK") || l == "NAK"))
            .count();
        assert_eq!(acks, 1);
    }
}
