//! Cascade delete resolution.
//!
//! Deleting a record also deletes every record that transitively depends on
//! it through the registry's relationship edges. The walk is breadth first
//! over the edge table with a visited set, so diamonds are reported once and
//! cyclic schemas terminate.
//!
//! [`CascadeWalk`] does no IO itself: it yields the lookups it needs and the
//! caller supplies the matching keys. This lets the same walk run against
//! the in-memory state or an asynchronous store.

use crate::{ModelName, ModelRegistry, RecordKey, RecordRef};
use std::collections::{HashSet, VecDeque};

/// Children of `parent` in `model` whose `foreign_key` holds the parent key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lookup {
    pub model: ModelName,
    pub foreign_key: String,
    pub parent: RecordKey,
}

/// Synchronous source of dependent keys.
pub trait DependentLookup {
    fn dependents(&self, lookup: &Lookup) -> Vec<RecordKey>;
}

/// Resumable cascade walk from one root record.
#[derive(Debug)]
pub struct CascadeWalk<'a> {
    registry: &'a ModelRegistry,
    visited: HashSet<RecordRef>,
    frontier: VecDeque<RecordRef>,
    lookups: VecDeque<Lookup>,
    found: Vec<RecordRef>,
}

impl<'a> CascadeWalk<'a> {
    pub fn new(registry: &'a ModelRegistry, root: RecordRef) -> Self {
        let mut visited = HashSet::new();
        visited.insert(root.clone());
        Self {
            registry,
            visited,
            frontier: VecDeque::from([root]),
            lookups: VecDeque::new(),
            found: Vec::new(),
        }
    }

    /// Next lookup to perform, or `None` once the walk is complete.
    pub fn next_lookup(&mut self) -> Option<Lookup> {
        while self.lookups.is_empty() {
            let parent = self.frontier.pop_front()?;
            for edge in self.registry.children_of(&parent.model) {
                self.lookups.push_back(Lookup {
                    model: edge.child.clone(),
                    foreign_key: edge.foreign_key.clone(),
                    parent: parent.key.clone(),
                });
            }
        }
        self.lookups.pop_front()
    }

    /// Feed the result of `lookup` back into the walk.
    pub fn supply(&mut self, lookup: &Lookup, keys: impl IntoIterator<Item = RecordKey>) {
        for key in keys {
            let child = RecordRef::new(lookup.model.clone(), key);
            if self.visited.insert(child.clone()) {
                self.found.push(child.clone());
                self.frontier.push_back(child);
            }
        }
    }

    /// Dependents in deletion order: the most deeply discovered first, so
    /// children always precede their parents. The root is not included.
    pub fn finish(self) -> Vec<RecordRef> {
        let mut found = self.found;
        found.reverse();
        found
    }
}

/// Compute all dependents of `root` using a synchronous lookup.
pub fn compute_dependents(
    registry: &ModelRegistry,
    root: RecordRef,
    source: &impl DependentLookup,
) -> Vec<RecordRef> {
    let mut walk = CascadeWalk::new(registry, root);
    while let Some(lookup) = walk.next_lookup() {
        let keys = source.dependents(&lookup);
        walk.supply(&lookup, keys);
    }
    walk.finish()
}
