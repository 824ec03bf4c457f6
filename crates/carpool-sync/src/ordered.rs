//! Ordered collections shared by the reconcilers.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use carpool_types::{MessageView, RoomView};

/// An entry with a stable identity and a total sort key.
///
/// Sort keys embed the id as the last component so exact ties still order
/// deterministically.
pub trait Keyed {
    type Id: Copy + Eq + Hash + Debug;
    type SortKey: Ord;

    fn id(&self) -> Self::Id;
    fn sort_key(&self) -> Self::SortKey;
}

impl Keyed for RoomView {
    type Id = Uuid;
    type SortKey = (DateTime<Utc>, Uuid);

    fn id(&self) -> Uuid {
        self.room.id
    }

    fn sort_key(&self) -> Self::SortKey {
        (self.room.departure_time, self.room.id)
    }
}

impl Keyed for MessageView {
    type Id = Uuid;
    type SortKey = (DateTime<Utc>, Uuid);

    fn id(&self) -> Uuid {
        self.id
    }

    fn sort_key(&self) -> Self::SortKey {
        (self.created_at, self.id)
    }
}

/// A set kept sorted by `sort_key`, unique by `id`.
#[derive(Debug, Clone)]
pub struct OrderedSet<T: Keyed> {
    items: Vec<T>,
}

impl<T: Keyed> Default for OrderedSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Keyed> OrderedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from items in any order. The first occurrence of an id wins.
    pub fn from_unsorted(items: impl IntoIterator<Item = T>) -> Self {
        let mut set = Self::new();
        for item in items {
            set.insert(item);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn contains(&self, id: T::Id) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: T::Id) -> Option<&T> {
        self.position(id).map(|pos| &self.items[pos])
    }

    /// Insert at the position the sort key dictates.
    ///
    /// Returns `false` and leaves the set untouched if the id is already present.
    pub fn insert(&mut self, item: T) -> bool {
        if self.contains(item.id()) {
            return false;
        }
        self.insert_sorted(item);
        true
    }

    /// Modify an entry in place and restore ordering. Returns `false` if absent.
    pub fn update(&mut self, id: T::Id, f: impl FnOnce(&mut T)) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let mut item = self.items.remove(pos);
        f(&mut item);
        debug_assert!(item.id() == id, "update must not change the id");
        self.insert_sorted(item);
        true
    }

    pub fn remove(&mut self, id: T::Id) -> Option<T> {
        self.position(id).map(|pos| self.items.remove(pos))
    }

    fn position(&self, id: T::Id) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn insert_sorted(&mut self, item: T) {
        let key = item.sort_key();
        let at = self.items.partition_point(|existing| existing.sort_key() < key);
        self.items.insert(at, item);
    }
}

impl<T: Keyed + Clone> OrderedSet<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

/// An append-only sequence, unique by `id`.
///
/// Only the seed is sorted; later entries keep arrival order.
#[derive(Debug, Clone)]
pub struct AppendLog<T: Keyed> {
    items: Vec<T>,
    ids: HashSet<T::Id>,
}

impl<T: Keyed> Default for AppendLog<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
        }
    }
}

impl<T: Keyed> AppendLog<T> {
    /// Seed from a snapshot in any order, normalized to ascending sort key.
    pub fn from_snapshot(items: impl IntoIterator<Item = T>) -> Self {
        let mut items: Vec<T> = items.into_iter().collect();
        items.sort_by_key(|item| item.sort_key());

        let mut log = Self::default();
        for item in items {
            log.push(item);
        }
        log
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn contains(&self, id: T::Id) -> bool {
        self.ids.contains(&id)
    }

    /// Append to the tail. Returns `false` if the id was already present.
    pub fn push(&mut self, item: T) -> bool {
        if !self.ids.insert(item.id()) {
            return false;
        }
        self.items.push(item);
        true
    }
}

impl<T: Keyed + Clone> AppendLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}
