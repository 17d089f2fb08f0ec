//! Family graph traversal: closure resolution, cycle guard, acyclicity audit.
//!
//! All walks are iterative worklists bounded by a visited set, so they
//! terminate in O(|families| + |edges|) even when the stored graph already
//! contains a cycle. Ids that appear on an edge but have no record are
//! traversed like any other id; they simply have no further edges.

use ahash::{AHashMap, AHashSet};

use crate::error::StoreResult;
use crate::store::GraphStore;
use crate::types::FamilyId;

/// Every family reachable from `starts` by following child edges,
/// including the start families themselves.
pub fn resolve_family_closure<'a, S, I>(store: &S, starts: I) -> StoreResult<AHashSet<FamilyId>>
where
    S: GraphStore + ?Sized,
    I: IntoIterator<Item = &'a FamilyId>,
{
    walk(store, starts, |store, family| store.fetch_child_families(family))
}

/// Ancestor-or-self set of `starts`, following parent edges.
pub fn collect_ancestors<'a, S, I>(store: &S, starts: I) -> StoreResult<AHashSet<FamilyId>>
where
    S: GraphStore + ?Sized,
    I: IntoIterator<Item = &'a FamilyId>,
{
    walk(store, starts, |store, family| store.fetch_parent_families(family))
}

fn walk<'a, S, I, F>(store: &S, starts: I, next: F) -> StoreResult<AHashSet<FamilyId>>
where
    S: GraphStore + ?Sized,
    I: IntoIterator<Item = &'a FamilyId>,
    F: Fn(&S, &FamilyId) -> StoreResult<Vec<FamilyId>>,
{
    let mut visited: AHashSet<FamilyId> = AHashSet::new();
    let mut to_visit: Vec<FamilyId> = Vec::new();

    for family in starts {
        if visited.insert(family.clone()) {
            to_visit.push(family.clone());
        }
    }

    while let Some(family) = to_visit.pop() {
        for neighbour in next(store, &family)? {
            if visited.insert(neighbour.clone()) {
                to_visit.push(neighbour);
            }
        }
    }

    Ok(visited)
}

/// Whether persisting `parent -> child` would make a family its own ancestor.
///
/// True iff `child == parent` or `child` is already an ancestor of `parent`.
/// The walk stops as soon as `child` is found.
pub fn would_create_cycle<S>(store: &S, parent: &FamilyId, child: &FamilyId) -> StoreResult<bool>
where
    S: GraphStore + ?Sized,
{
    if parent == child {
        return Ok(true);
    }

    let mut visited: AHashSet<FamilyId> = AHashSet::new();
    let mut to_visit: Vec<FamilyId> = vec![parent.clone()];
    visited.insert(parent.clone());

    while let Some(family) = to_visit.pop() {
        for ancestor in store.fetch_parent_families(&family)? {
            if &ancestor == child {
                return Ok(true);
            }
            if visited.insert(ancestor.clone()) {
                to_visit.push(ancestor);
            }
        }
    }

    Ok(false)
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Audit the whole family graph for existing cycles.
///
/// Returns every back edge `(from, to)` found by a depth-first walk over
/// child edges; an empty result means the graph is acyclic. Read-only.
pub fn find_cycles<S>(store: &S) -> StoreResult<Vec<(FamilyId, FamilyId)>>
where
    S: GraphStore + ?Sized,
{
    let mut families = store.list_families()?;
    families.sort();

    let mut marks: AHashMap<FamilyId, Mark> = AHashMap::new();
    let mut back_edges = Vec::new();

    for root in families {
        if marks.contains_key(&root) {
            continue;
        }

        // Explicit DFS stack of (family, children, next child index).
        let mut stack: Vec<(FamilyId, Vec<FamilyId>, usize)> = Vec::new();
        let children = sorted_children(store, &root)?;
        marks.insert(root.clone(), Mark::InProgress);
        stack.push((root, children, 0));

        while let Some((family, children, idx)) = stack.last_mut() {
            if *idx >= children.len() {
                marks.insert(family.clone(), Mark::Done);
                stack.pop();
                continue;
            }
            let child = children[*idx].clone();
            *idx += 1;

            match marks.get(&child) {
                Some(Mark::InProgress) => {
                    tracing::warn!(from = %family, to = %child, "family graph contains a cycle");
                    back_edges.push((family.clone(), child));
                }
                Some(Mark::Done) => {}
                None => {
                    let grandchildren = sorted_children(store, &child)?;
                    marks.insert(child.clone(), Mark::InProgress);
                    stack.push((child, grandchildren, 0));
                }
            }
        }
    }

    Ok(back_edges)
}

fn sorted_children<S>(store: &S, family: &FamilyId) -> StoreResult<Vec<FamilyId>>
where
    S: GraphStore + ?Sized,
{
    let mut children = store.fetch_child_families(family)?;
    children.sort();
    Ok(children)
}

#[cfg(test)]
mod tests;
