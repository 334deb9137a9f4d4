use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::capability::Capability;
use crate::identifier::Identifier;
use crate::session::Session;

/// Identifier -> live session map. At most one slot exists per identifier;
/// a slot is reserved before its session is built and released exactly once.
pub struct SessionRegistry<C: Capability> {
    inner: Arc<RegistryInner<C>>,
}

struct RegistryInner<C: Capability> {
    slots: DashMap<Identifier, Slot<C>>,
    next_generation: AtomicU64,
}

struct Slot<C: Capability> {
    generation: u64,
    session: Option<Arc<Session<C>>>,
}

impl<C: Capability> Clone for SessionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Capability> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> SessionRegistry<C> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Claims the slot for `identifier`, returning its generation, or `None`
    /// if a session already holds (or is building into) it.
    pub fn reserve(&self, identifier: &Identifier) -> Option<u64> {
        match self.inner.slots.entry(identifier.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                entry.insert(Slot {
                    generation,
                    session: None,
                });
                Some(generation)
            }
        }
    }

    /// Attaches the built session to its reserved slot. Fails if the slot was
    /// released or drained in the meantime.
    pub fn activate(
        &self,
        identifier: &Identifier,
        generation: u64,
        session: Arc<Session<C>>,
    ) -> bool {
        match self.inner.slots.get_mut(identifier) {
            Some(mut slot) if slot.generation == generation => {
                slot.session = Some(session);
                true
            }
            _ => false,
        }
    }

    /// Frees the slot if it still belongs to `generation`. Safe to repeat.
    pub fn release(&self, identifier: &Identifier, generation: u64) -> bool {
        self.inner
            .slots
            .remove_if(identifier, |_, slot| slot.generation == generation)
            .is_some()
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.inner.slots.contains_key(identifier)
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<Session<C>>> {
        self.inner
            .slots
            .get(identifier)
            .and_then(|slot| slot.session.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn identifiers(&self) -> Vec<Identifier> {
        self.inner
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Empties the registry, handing back every built session.
    pub fn drain(&self) -> Vec<Arc<Session<C>>> {
        let identifiers = self.identifiers();
        let mut sessions = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            if let Some((_, slot)) = self.inner.slots.remove(&identifier) {
                sessions.extend(slot.session);
            }
        }
        sessions
    }
}
