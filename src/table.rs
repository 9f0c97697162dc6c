use crate::{Gc, ObjStr, Value};

const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;
const MIN_CAPACITY: usize = 8;

/// A hash table keyed by interned strings, using open addressing with linear
/// probing.
///
/// Because every key is interned, keys compare by handle identity. Deleted
/// slots become tombstones so probe sequences stay unbroken; tombstones count
/// toward the load factor (at most 3/4 before doubling) but are dropped when
/// the table grows.
#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    len: usize,
}

/// A single slot in the table.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Entry {
    /// Never occupied; terminates probe sequences
    Empty,
    /// Previously occupied; probe sequences continue through it
    Tombstone,
    /// Occupied
    Full {
        /// The interned key
        key: Gc<ObjStr>,
        /// The key's content hash, cached so probing and growth never need
        /// the heap
        hash: u32,
        /// The stored value
        value: Value,
    },
}

impl Table {
    /// Look up the value stored under the key. `hash` must be the key's
    /// content hash.
    pub fn get(&self, key: Gc<ObjStr>, hash: u32) -> Option<Value> {
        if self.len == 0 {
            return None;
        }
        match self.entries[self.find_slot(key, hash)] {
            Entry::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Map the key to the value. Returns true when the key was not present
    /// before.
    pub fn set(&mut self, key: Gc<ObjStr>, hash: u32, value: Value) -> bool {
        if (self.len + 1) * MAX_LOAD_DENOMINATOR > self.entries.len() * MAX_LOAD_NUMERATOR {
            self.grow();
        }
        let slot = self.find_slot(key, hash);
        let is_new = match self.entries[slot] {
            Entry::Full { .. } => false,
            // A reused tombstone was already counted.
            Entry::Tombstone => true,
            Entry::Empty => {
                self.len += 1;
                true
            }
        };
        self.entries[slot] = Entry::Full { key, hash, value };
        is_new
    }

    /// Remove the key, leaving a tombstone. Returns true when the key was
    /// present.
    pub fn delete(&mut self, key: Gc<ObjStr>, hash: u32) -> bool {
        if self.len == 0 {
            return false;
        }
        let slot = self.find_slot(key, hash);
        match self.entries[slot] {
            Entry::Full { .. } => {
                self.entries[slot] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Visit every mapping in the table.
    pub fn iter(&self) -> impl Iterator<Item = (Gc<ObjStr>, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Find a key by its content hash, using `eq` to compare candidates'
    /// contents. This is the interner's lookup: it runs before a string is
    /// allocated, when no handle exists to compare against.
    pub fn find_key<F>(&self, hash: u32, mut eq: F) -> Option<Gc<ObjStr>>
    where
        F: FnMut(Gc<ObjStr>) -> bool,
    {
        if self.len == 0 {
            return None;
        }
        let mut index = hash as usize % self.entries.len();
        loop {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Full {
                    key,
                    hash: stored, ..
                } => {
                    if stored == hash && eq(key) {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) % self.entries.len();
        }
    }

    /// Drop every mapping whose key fails the predicate, leaving tombstones.
    pub fn retain_keys<F>(&mut self, mut keep: F)
    where
        F: FnMut(Gc<ObjStr>) -> bool,
    {
        for entry in &mut self.entries {
            if let Entry::Full { key, .. } = entry {
                if !keep(*key) {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }

    /// Bytes owned by the table's storage, for the allocator's accounting.
    pub(crate) fn heap_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Walk the probe sequence for the key. Returns the index of the matching
    /// full slot, or of the slot an insertion should use: the first tombstone
    /// seen, falling back to the terminating empty slot.
    fn find_slot(&self, key: Gc<ObjStr>, hash: u32) -> usize {
        let mut index = hash as usize % self.entries.len();
        let mut tombstone = None;
        loop {
            match self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: stored, .. } => {
                    if stored == key {
                        return index;
                    }
                }
            }
            index = (index + 1) % self.entries.len();
        }
    }

    /// Double the capacity and re-insert every mapping. Tombstones are not
    /// carried over, so `len` is recounted.
    fn grow(&mut self) {
        let capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::Empty; capacity]);
        self.len = 0;
        for entry in old {
            if let Entry::Full { hash, .. } = entry {
                let mut index = hash as usize % capacity;
                while !matches!(self.entries[index], Entry::Empty) {
                    index = (index + 1) % capacity;
                }
                self.entries[index] = entry;
                self.len += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(index: usize) -> Gc<ObjStr> {
        Gc::new(index)
    }

    #[test]
    fn set_get_and_overwrite() {
        let mut table = Table::default();
        assert!(table.set(key(0), 17, Value::Number(1.0)));
        assert!(!table.set(key(0), 17, Value::Number(2.0)));
        assert_eq!(table.get(key(0), 17), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(1), 17), None);
    }

    #[test]
    fn delete_leaves_probe_sequence_unbroken() {
        let mut table = Table::default();
        // Three keys with the same hash occupy one probe sequence.
        for i in 0..3 {
            table.set(key(i), 5, Value::Number(i as f64));
        }
        assert!(table.delete(key(1), 5));
        assert!(!table.delete(key(1), 5));
        assert_eq!(table.get(key(0), 5), Some(Value::Number(0.0)));
        assert_eq!(table.get(key(2), 5), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(1), 5), None);
    }

    #[test]
    fn tombstones_are_reused_for_insertion() {
        let mut table = Table::default();
        for i in 0..3 {
            table.set(key(i), 5, Value::Nil);
        }
        table.delete(key(1), 5);
        let before = table.len;
        assert!(table.set(key(9), 5, Value::Bool(true)));
        // The tombstone slot was recycled, so the load did not grow.
        assert_eq!(table.len, before);
        assert_eq!(table.get(key(9), 5), Some(Value::Bool(true)));
        assert_eq!(table.get(key(2), 5), Some(Value::Nil));
    }

    #[test]
    fn growth_preserves_mappings_and_drops_tombstones() {
        let mut table = Table::default();
        for i in 0..64 {
            table.set(key(i), i as u32 * 7, Value::Number(i as f64));
        }
        for i in 0..32 {
            table.delete(key(i), i as u32 * 7);
        }
        // Force another growth; tombstones must not survive it.
        for i in 64..128 {
            table.set(key(i), i as u32 * 7, Value::Number(i as f64));
        }
        for i in 0..32 {
            assert_eq!(table.get(key(i), i as u32 * 7), None);
        }
        for i in 32..128 {
            assert_eq!(table.get(key(i), i as u32 * 7), Some(Value::Number(i as f64)));
        }
        assert_eq!(table.iter().count(), 96);
    }

    #[test]
    fn find_key_skips_tombstones_and_checks_content() {
        let mut table = Table::default();
        table.set(key(3), 11, Value::Nil);
        table.set(key(4), 11, Value::Nil);
        table.delete(key(3), 11);
        assert_eq!(table.find_key(11, |k| k == key(4)), Some(key(4)));
        assert_eq!(table.find_key(11, |k| k == key(3)), None);
        assert_eq!(table.find_key(12, |_| true), None);
    }

    #[test]
    fn retain_keys_purges_mappings() {
        let mut table = Table::default();
        for i in 0..10 {
            table.set(key(i), i as u32, Value::Nil);
        }
        table.retain_keys(|k| k == key(4));
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.get(key(4), 4), Some(Value::Nil));
        assert_eq!(table.get(key(5), 5), None);
    }
}
