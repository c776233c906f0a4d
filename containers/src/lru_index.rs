use crate::error::ContainerErrors;
use derivative::Derivative;
use std::collections::VecDeque;

/// Recency ordering over a set of keys.
///
/// The least recently used key sits at the front, the most recently used at the back. Every key
/// appears at most once, so the index can be kept in lock-step with the key set of whatever
/// storage it is ordering.
///
/// Lookups are linear; the index is intended for small working sets (tens to low hundreds of
/// entries) where a linked hash map would be overkill.
#[derive(Derivative, Clone)]
#[derivative(Debug, Default(bound = ""))]
pub struct LruIndex<K> {
    order: VecDeque<K>,
}

impl<K: PartialEq + Clone> LruIndex<K> {
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.order.iter().position(|k| k == key)
    }

    /// Marks `key` as the most recently used, inserting it if it is not tracked yet
    pub fn touch(&mut self, key: &K) {
        if let Some(index) = self.position(key) {
            // remove + push keeps the no-duplicate invariant
            if let Some(existing) = self.order.remove(index) {
                self.order.push_back(existing);
            }
        } else {
            self.order.push_back(key.clone());
        }
    }

    /// Moves an already tracked key to the most recently used position.
    ///
    /// Unlike [`Self::touch`] this never grows the index.
    pub fn promote(&mut self, key: &K) -> Result<(), ContainerErrors> {
        let index = self.position(key).ok_or(ContainerErrors::MissingKey)?;
        if let Some(existing) = self.order.remove(index) {
            self.order.push_back(existing);
        }
        Ok(())
    }

    /// Stops tracking `key`. Returns `false` if it was not tracked.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.position(key) {
            None => false,
            Some(index) => self.order.remove(index).is_some(),
        }
    }

    /// Next eviction candidate
    pub fn least_recent(&self) -> Option<&K> {
        self.order.front()
    }

    pub fn most_recent(&self) -> Option<&K> {
        self.order.back()
    }

    pub fn pop_least_recent(&mut self) -> Option<K> {
        self.order.pop_front()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    /// Iterates from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }
}
