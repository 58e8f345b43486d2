use thiserror::Error;

use crate::id::{GenerationId, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("slot {0} was never handed out")]
    UnknownSlot(u32),
    #[error("slot {slot} is at generation {current}, handle carries {stale}")]
    StaleGeneration { slot: u32, current: u32, stale: u32 },
}

/// Generational handle into a [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    slot: SlotId,
    generation: GenerationId,
}

impl SlotKey {
    pub const fn new(slot: SlotId, generation: GenerationId) -> Self {
        Self { slot, generation }
    }

    pub const fn slot(self) -> SlotId {
        self.slot
    }

    pub const fn generation(self) -> GenerationId {
        self.generation
    }
}

#[derive(Debug)]
struct SlotEntry<T> {
    generation: GenerationId,
    value: Option<T>,
}

/// Slot storage whose freed slots are recycled with a bumped generation, so a handle to a
/// removed value never resolves to the value that later reuses its slot.
#[derive(Debug)]
pub struct SlotTable<T> {
    entries: Vec<SlotEntry<T>>,
    freelist: Vec<SlotId>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            freelist: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlotKey {
        self.insert_with(|_| value)
    }

    /// Inserts a value that needs to know its own key.
    pub fn insert_with(&mut self, make: impl FnOnce(SlotKey) -> T) -> SlotKey {
        self.len += 1;
        if let Some(slot) = self.freelist.pop() {
            let entry = &mut self.entries[slot.raw() as usize];
            let key = SlotKey::new(slot, entry.generation);
            entry.value = Some(make(key));
            return key;
        }
        let slot = SlotId::new(self.entries.len() as u32);
        let key = SlotKey::new(slot, GenerationId::new(0));
        self.entries.push(SlotEntry {
            generation: key.generation,
            value: Some(make(key)),
        });
        key
    }

    fn entry(&self, key: SlotKey) -> Result<&SlotEntry<T>, IdError> {
        let slot = key.slot.raw();
        let entry = self
            .entries
            .get(slot as usize)
            .ok_or(IdError::UnknownSlot(slot))?;
        if entry.generation != key.generation || entry.value.is_none() {
            return Err(IdError::StaleGeneration {
                slot,
                current: entry.generation.raw(),
                stale: key.generation.raw(),
            });
        }
        Ok(entry)
    }

    pub fn lookup(&self, key: SlotKey) -> Result<&T, IdError> {
        let entry = self.entry(key)?;
        entry.value.as_ref().ok_or(IdError::UnknownSlot(key.slot.raw()))
    }

    pub fn get(&self, key: SlotKey) -> Option<&T> {
        self.lookup(key).ok()
    }

    pub fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.entry(key).ok()?;
        self.entries[key.slot.raw() as usize].value.as_mut()
    }

    pub fn contains(&self, key: SlotKey) -> bool {
        self.entry(key).is_ok()
    }

    pub fn remove(&mut self, key: SlotKey) -> Result<T, IdError> {
        self.entry(key)?;
        let entry = &mut self.entries[key.slot.raw() as usize];
        let value = entry
            .value
            .take()
            .ok_or(IdError::UnknownSlot(key.slot.raw()))?;
        entry.generation = entry.generation.next();
        self.freelist.push(key.slot);
        self.len -= 1;
        Ok(value)
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever created, live or free.
    pub fn capacity_slots(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> + '_ {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| {
            let value = entry.value.as_ref()?;
            Some((SlotKey::new(SlotId::new(slot as u32), entry.generation), value))
        })
    }
}
