use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use serde::Serialize;

use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{peel_to_commit, read_commit, ObjectStore};
use crate::refs::resolve;
use crate::repo::Repo;
use crate::types::Commit;

/// one commit as shown in a history listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub id: ObjectId,
    pub short_id: String,
    pub author: String,
    pub email: String,
    /// author time, unix seconds
    pub timestamp: i64,
    /// committer time, unix seconds
    pub committed_at: i64,
    pub message: String,
    pub short_message: String,
    pub parent_ids: Vec<ObjectId>,
}

impl CommitSummary {
    fn new(id: ObjectId, commit: &Commit) -> Self {
        Self {
            id,
            short_id: id.short(),
            author: commit.author.name.clone(),
            email: commit.author.email.clone(),
            timestamp: commit.author.time,
            committed_at: commit.committer.time,
            message: commit.message.clone(),
            short_message: commit.summary().to_string(),
            parent_ids: commit.parents.clone(),
        }
    }
}

/// heap entry: newest committer time first, then smallest id
struct Pending {
    time: i64,
    id: ObjectId,
    commit: Commit,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Pending {}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| Reverse(self.id).cmp(&Reverse(other.id)))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// commit history reachable from `start`, newest first
///
/// merges are walked once per commit. `offset` entries are skipped, then at
/// most `limit` are returned.
pub fn history(repo: &Repo, start: &str, limit: usize, offset: usize) -> Result<Vec<CommitSummary>> {
    let store = ObjectStore::open(repo);
    let tip = peel_to_commit(&store, &resolve(repo, start)?)?;
    walk(&store, tip, limit, offset)
}

pub(crate) fn walk(
    store: &ObjectStore,
    tip: ObjectId,
    limit: usize,
    offset: usize,
) -> Result<Vec<CommitSummary>> {
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut heap = BinaryHeap::new();
    let mut out = Vec::new();
    let mut skipped = 0;

    visited.insert(tip);
    let commit = read_commit(store, &tip)?;
    heap.push(Pending {
        time: commit.committer.time,
        id: tip,
        commit,
    });

    while let Some(Pending { id, commit, .. }) = heap.pop() {
        if out.len() >= limit {
            break;
        }
        for parent in &commit.parents {
            if visited.insert(*parent) {
                let parent_commit = read_commit(store, parent)?;
                heap.push(Pending {
                    time: parent_commit.committer.time,
                    id: *parent,
                    commit: parent_commit,
                });
            }
        }
        if skipped < offset {
            skipped += 1;
            continue;
        }
        out.push(CommitSummary::new(id, &commit));
    }

    Ok(out)
}
