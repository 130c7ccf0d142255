//! client side of the fetch protocol
//!
//! negotiates one branch tip with upload-pack and unpacks the reply into a
//! quarantine. refs are never touched here.

use std::collections::{BinaryHeap, HashSet};
use std::io::{Cursor, Read};

use tracing::{debug, info, trace};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, ObjectId};
use crate::object::{peel_to_commit, read_commit, ObjectStore, Quarantine};
use crate::ops::connectivity::check_connectivity;
use crate::pack::unpack;
use crate::progress::{CancellationToken, Phase, Progress, ProgressSink};
use crate::refs::list_refs;
use crate::repo::Repo;
use crate::transport::advertise::Advertisement;
use crate::transport::pktline::{read_pkt_or_raw, wire_error, write_flush, write_text, PktLine, SidebandReader};
use crate::transport::ssh::classify_stderr;
use crate::transport::{Connection, RemoteDescriptor, AGENT};

/// what to fetch and from where
pub struct FetchRequest<'a> {
    pub remote: &'a RemoteDescriptor,
    pub branch: &'a str,
    pub settings: &'a Settings,
    pub cancel: &'a CancellationToken,
}

#[derive(Clone, Debug)]
pub struct FetchOutcome {
    /// the remote branch tip
    pub tip: ObjectId,
    /// objects in the received pack
    pub received: u64,
    /// the tip was already complete locally; nothing was transferred
    pub already_present: bool,
    /// quarantined objects to promote, dependencies first
    pub promote_order: Vec<ObjectId>,
}

/// fetch `request.branch` into `quarantine`
///
/// on success the tip's closure is complete across the quarantine and the
/// main store; the caller promotes `promote_order` and updates refs.
pub fn fetch_pack(
    repo: &Repo,
    quarantine: &Quarantine,
    request: &FetchRequest<'_>,
    sink: &mut ProgressSink<'_>,
) -> Result<FetchOutcome> {
    let mut progress = Progress::new(sink, request.settings.progress_steps);
    progress.phase(Phase::Connecting, None);
    request.cancel.check()?;

    let mut conn = Connection::open(request.remote, request.settings)?;
    match negotiate_and_receive(repo, quarantine, request, &mut conn, &mut progress) {
        Ok(outcome) => {
            conn.finish();
            let message = if outcome.already_present {
                "already up to date".to_string()
            } else {
                format!("received {} objects", outcome.received)
            };
            progress.finish(message);
            info!(
                remote = %request.remote,
                branch = request.branch,
                tip = %outcome.tip,
                received = outcome.received,
                "fetch complete"
            );
            Ok(outcome)
        }
        Err(e) => Err(conn.explain(e)),
    }
}

fn negotiate_and_receive(
    repo: &Repo,
    quarantine: &Quarantine,
    request: &FetchRequest<'_>,
    conn: &mut Connection,
    progress: &mut Progress<'_, '_>,
) -> Result<FetchOutcome> {
    let adv = Advertisement::read(conn.reader())?;
    if adv.object_format != repo.object_format() {
        return Err(Error::Unsupported(format!(
            "remote uses {} objects, local repository uses {}",
            adv.object_format,
            repo.object_format()
        )));
    }
    let tip = adv
        .branch(request.branch)
        .ok_or_else(|| Error::BranchNotFound(request.branch.to_string()))?
        .id;
    progress.phase(Phase::Negotiating, None);
    request.cancel.check()?;

    let main = ObjectStore::open(repo);
    if main.walk_missing([&tip]).is_empty() {
        debug!(%tip, "tip already present");
        write_flush(conn.writer())?;
        return Ok(FetchOutcome {
            tip,
            received: 0,
            already_present: true,
            promote_order: vec![],
        });
    }

    let mut caps = Vec::new();
    for cap in ["multi_ack", "side-band-64k", "ofs-delta"] {
        if adv.has_capability(cap) {
            caps.push(cap.to_string());
        }
    }
    if repo.object_format() != HashAlgorithm::Sha1 {
        caps.push(format!("object-format={}", repo.object_format()));
    }
    caps.push(format!("agent={}", AGENT));

    let writer = conn.writer();
    write_text(writer, &format!("want {} {}", tip, caps.join(" ")))?;
    write_flush(writer)?;
    let haves = collect_haves(repo, &main, request.settings.max_haves)?;
    debug!(haves = haves.len(), "sending haves");
    for have in &haves {
        write_text(writer, &format!("have {}", have))?;
    }
    write_text(writer, "done")?;
    writer.flush().map_err(wire_error)?;

    let replay = read_acknowledgements(conn.reader())?;

    let framed = adv.has_capability("side-band-64k");
    let cancel = request.cancel.clone();
    let mut source = Cursor::new(replay).chain(conn.reader());
    let mut reader = SidebandReader::new(&mut source, framed, cancel, |line| {
        trace!(line, "remote");
    });
    let unpacked = match unpack(&mut reader, quarantine.store(), progress, request.cancel) {
        Ok(unpacked) => unpacked,
        Err(e) => return Err(reader.take_failure().unwrap_or(e)),
    };
    debug!(
        objects = unpacked.ids.len(),
        deltas = unpacked.deltas,
        bytes = unpacked.bytes,
        "pack unpacked"
    );

    progress.phase(Phase::Checking, None);
    request.cancel.check()?;
    let promote_order = check_connectivity(quarantine, &tip)?;

    Ok(FetchOutcome {
        tip,
        received: unpacked.ids.len() as u64,
        already_present: false,
        promote_order,
    })
}

/// consume the `ACK` and `NAK` replies that precede the pack
///
/// upload-pack may acknowledge every common `have`. the wire bytes of the
/// first packet that is neither, or of a raw pack start, are returned so the
/// pack reader sees them.
fn read_acknowledgements<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut acks = 0usize;
    loop {
        let (wire, pkt) = read_pkt_or_raw(reader)?;
        let Some(line) = pkt.as_ref().and_then(PktLine::as_text) else {
            debug!(acks, "negotiation finished");
            return Ok(wire);
        };
        if line == "NAK" || line.starts_with("ACK ") {
            trace!(line, "negotiation reply");
            acks += usize::from(line != "NAK");
        } else if let Some(message) = line.strip_prefix("ERR ") {
            return Err(classify_stderr(message).unwrap_or_else(|| Error::Remote(message.to_string())));
        } else {
            debug!(acks, "negotiation finished");
            return Ok(wire);
        }
    }
}

/// commit ids we can offer as common ground: local tips, then their
/// ancestors newest first, at most `limit`
fn collect_haves(repo: &Repo, store: &ObjectStore, limit: usize) -> Result<Vec<ObjectId>> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue: BinaryHeap<(i64, ObjectId)> = BinaryHeap::new();

    for (name, id) in list_refs(repo, "refs/")? {
        match peel_to_commit(store, &id) {
            Ok(commit_id) => {
                if seen.insert(commit_id) {
                    let commit = read_commit(store, &commit_id)?;
                    queue.push((commit.committer.time, commit_id));
                }
            }
            Err(e) => trace!(name, error = %e, "ref skipped for negotiation"),
        }
    }

    let mut haves = Vec::new();
    while let Some((_, id)) = queue.pop() {
        if haves.len() >= limit {
            break;
        }
        haves.push(id);
        for parent in read_commit(store, &id)?.parents {
            if seen.insert(parent) {
                let commit = read_commit(store, &parent)?;
                queue.push((commit.committer.time, parent));
            }
        }
    }
    Ok(haves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::identity::Identity;
    use crate::progress::ProgressEvent;
    use crate::testutil::{commit_on, remote_repo};
    use crate::transport::serve::AUTHORIZED_KEYS;
    use crate::transport::{AuthMode, Provider};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn local(path: &std::path::Path, auth: AuthMode) -> RemoteDescriptor {
        RemoteDescriptor::new(&path.display().to_string(), Some(Provider::Local), auth).unwrap()
    }

    fn run(
        repo: &Repo,
        remote: &RemoteDescriptor,
        branch: &str,
        sink: &mut ProgressSink<'_>,
    ) -> Result<FetchOutcome> {
        let settings = Settings::default();
        let cancel = CancellationToken::new();
        let request = FetchRequest {
            remote,
            branch,
            settings: &settings,
            cancel: &cancel,
        };
        let quarantine = Quarantine::new(repo)?;
        let outcome = fetch_pack(repo, &quarantine, &request, sink)?;
        quarantine.promote(&outcome.promote_order)?;
        Ok(outcome)
    }

    #[test]
    fn test_fetch_then_up_to_date() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a.txt", b"one")], 10);
        let tip = commit_on(&upstream, "main", &[("a.txt", "two"), ("d/b.txt", "x")], 20);

        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();
        let remote = local(upstream.path(), AuthMode::Anonymous);

        let events = Arc::new(Mutex::new(Vec::<ProgressEvent>::new()));
        let sink_events = Arc::clone(&events);
        let mut sink = ProgressSink::callback(move |e| sink_events.lock().unwrap().push(e.clone()));

        let outcome = run(&repo, &remote, "main", &mut sink).unwrap();
        assert_eq!(outcome.tip, tip);
        assert!(!outcome.already_present);
        assert!(outcome.received > 0);
        assert!(ObjectStore::open(&repo).has(&tip));

        {
            let events = events.lock().unwrap();
            assert_eq!(events.last().unwrap().phase, Phase::Done);
            assert!(events.windows(2).all(|w| w[0].processed <= w[1].processed));
            assert!(events.iter().any(|e| e.total == outcome.received));
        }

        let again = run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap();
        assert!(again.already_present);
        assert_eq!(again.received, 0);
    }

    #[test]
    fn test_incremental_fetch_sends_only_new_objects() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a.txt", "one"), ("big.txt", "unchanged")], 10);

        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();
        let remote = local(upstream.path(), AuthMode::Anonymous);
        let first = run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap();
        crate::refs::update_ref(&repo, "refs/remotes/origin/main", &first.tip, None).unwrap();

        commit_on(&upstream, "main", &[("a.txt", "two"), ("big.txt", "unchanged")], 20);
        let second = run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap();
        // new commit, new root tree, new blob
        assert_eq!(second.received, 3);
    }

    #[test]
    fn test_missing_branch() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a", b"a")], 1);
        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();

        let err = run(
            &repo,
            &local(upstream.path(), AuthMode::Anonymous),
            "dev",
            &mut ProgressSink::Silent,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BranchNotFound(ref b) if b == "dev"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_cancelled_before_connect() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a", b"a")], 1);
        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();
        let remote = local(upstream.path(), AuthMode::Anonymous);

        let settings = Settings::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = FetchRequest {
            remote: &remote,
            branch: "main",
            settings: &settings,
            cancel: &cancel,
        };
        let quarantine = Quarantine::new(&repo).unwrap();
        let err = fetch_pack(&repo, &quarantine, &request, &mut ProgressSink::Silent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_regenerated_key_is_rejected() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a", b"a")], 1);
        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();

        let identity = Identity::new(&dir.path().join("base"));
        let registered = identity.generate().unwrap();
        std::fs::write(
            upstream.path().join(AUTHORIZED_KEYS),
            format!("{}\n", registered.public_key),
        )
        .unwrap();
        let remote = local(upstream.path(), AuthMode::Key(identity.clone()));

        run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap();

        identity.generate().unwrap();
        commit_on(&upstream, "main", &[("a", b"b")], 2);
        let err = run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[test]
    fn test_acknowledgements_before_sideband_pack_are_drained() {
        let id = HashAlgorithm::Sha1.object_id("commit", b"x");
        let mut wire = Vec::new();
        for _ in 0..30 {
            write_text(&mut wire, &format!("ACK {}", id)).unwrap();
        }
        write_text(&mut wire, "NAK").unwrap();
        let mut band = Vec::new();
        crate::transport::pktline::write_band(&mut band, 1, b"PACK").unwrap();
        wire.extend_from_slice(&band);

        let mut input = Cursor::new(wire);
        assert_eq!(read_acknowledgements(&mut input).unwrap(), band);
        assert_eq!(input.position() as usize, input.get_ref().len());
    }

    #[test]
    fn test_acknowledgements_before_raw_pack() {
        let mut wire = Vec::new();
        write_text(&mut wire, "NAK").unwrap();
        wire.extend_from_slice(b"PACK\0\0\0\x02");
        let replay = read_acknowledgements(&mut Cursor::new(wire)).unwrap();
        assert_eq!(replay, b"PACK");
    }

    #[test]
    fn test_remote_error_during_negotiation() {
        let mut wire = Vec::new();
        write_text(&mut wire, "ERR upload-pack: not our ref").unwrap();
        let err = read_acknowledgements(&mut Cursor::new(wire)).unwrap_err();
        assert!(err.to_string().contains("not our ref"));
    }

    #[test]
    fn test_new_branch_with_many_common_commits() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        for t in 1..=6 {
            commit_on(&upstream, "main", &[("n.txt", t.to_string())], t);
        }

        let repo = Repo::init(&dir.path().join("clone"), HashAlgorithm::Sha1).unwrap();
        let remote = local(upstream.path(), AuthMode::Anonymous);
        let first = run(&repo, &remote, "main", &mut ProgressSink::Silent).unwrap();
        crate::refs::update_ref(&repo, "refs/remotes/origin/main", &first.tip, None).unwrap();

        // every local commit is common, so upload-pack acknowledges each have
        crate::refs::update_ref(&upstream, "refs/heads/dev", &first.tip, None).unwrap();
        let dev = commit_on(&upstream, "dev", &[("n.txt", "dev")], 10);
        let outcome = run(&repo, &remote, "dev", &mut ProgressSink::Silent).unwrap();
        assert_eq!(outcome.tip, dev);
        assert_eq!(outcome.received, 3);
        assert!(ObjectStore::open(&repo).has(&dev));
    }
}
