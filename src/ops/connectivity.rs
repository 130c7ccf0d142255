use std::collections::HashSet;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{ObjectKind, ObjectStore, Quarantine};
use crate::types::{Commit, EntryMode, Tag, Tree};

/// objects an object points at, in a stable order
fn links(store: &ObjectStore, id: &ObjectId) -> Result<Vec<ObjectId>> {
    let raw = store.get(id)?;
    let links = match raw.kind {
        ObjectKind::Commit => {
            let commit = Commit::parse(&raw.data)?;
            let mut ids = Vec::with_capacity(commit.parents.len() + 1);
            ids.push(commit.tree);
            ids.extend(commit.parents);
            ids
        }
        // submodule commits live in another repository
        ObjectKind::Tree => Tree::parse(&raw.data, store.algorithm())?
            .entries()
            .iter()
            .filter(|e| e.mode != EntryMode::Gitlink)
            .map(|e| e.id)
            .collect(),
        ObjectKind::Tag => vec![Tag::parse(&raw.data)?.object],
        ObjectKind::Blob => vec![],
    };
    Ok(links)
}

/// every object reachable from `roots`, skipping anything in `exclude`
///
/// an excluded object's closure is not walked either.
pub fn reachable(
    store: &ObjectStore,
    roots: &[ObjectId],
    exclude: &HashSet<ObjectId>,
) -> Result<Vec<ObjectId>> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<ObjectId> = roots.to_vec();

    while let Some(id) = stack.pop() {
        if exclude.contains(&id) || !seen.insert(id) {
            continue;
        }
        let next = links(store, &id)?;
        out.push(id);
        stack.extend(next.into_iter().rev());
    }
    Ok(out)
}

/// verify that `tip` has a complete closure across the quarantine and the
/// main store
///
/// returns the quarantined objects the tip needs, dependencies first, ready
/// for [`Quarantine::promote`]. objects already in the main store are not
/// descended into: the main store only holds complete closures.
pub fn check_connectivity(quarantine: &Quarantine, tip: &ObjectId) -> Result<Vec<ObjectId>> {
    let store = quarantine.store();
    let mut visited: HashSet<ObjectId> = HashSet::new();
    let mut missing: HashSet<ObjectId> = HashSet::new();
    let mut order = Vec::new();
    // (id, children already pushed)
    let mut stack = vec![(*tip, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        if !quarantine.holds(&id) {
            if !store.has(&id) {
                missing.insert(id);
            }
            continue;
        }

        stack.push((id, true));
        for child in links(store, &id)? {
            if !visited.contains(&child) {
                stack.push((child, false));
            }
        }
    }

    if !missing.is_empty() {
        debug!(%tip, missing = missing.len(), "connectivity check failed");
        return Err(Error::Incomplete {
            tip: *tip,
            count: missing.len(),
        });
    }
    debug!(%tip, new = order.len(), "connectivity ok");
    Ok(order)
}

/// is `ancestor` reachable from `descendant` through parent links
pub fn is_ancestor(store: &ObjectStore, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut stack = vec![*descendant];
    while let Some(id) = stack.pop() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        let data = store.get_kind(&id, ObjectKind::Commit)?;
        stack.extend(Commit::parse(&data)?.parents);
    }
    Ok(false)
}
