// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity per-task tables.
//!
//! An `IdTable` maps task IDs to values of type `T`, stored densely and kept
//! sorted by ID so that lookup is a binary search. Task IDs are handed out in
//! increasing order, so insertion is almost always a push at the end.
//! Nothing here allocates; a full table refuses new keys.

use abi::TaskId;

use crate::err::KernError;

#[derive(Debug)]
pub(crate) struct IdTable<T, const N: usize> {
    contents: heapless::Vec<(TaskId, T), N>,
}

impl<T, const N: usize> Default for IdTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> IdTable<T, N> {
    pub(crate) const fn new() -> Self {
        Self {
            contents: heapless::Vec::new(),
        }
    }

    fn position(&self, id: TaskId) -> Result<usize, usize> {
        self.contents.binary_search_by_key(&id, |(k, _)| *k)
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&T> {
        let i = self.position(id).ok()?;
        Some(&self.contents[i].1)
    }

    /// Returns the entry for `id`, creating it with `make` if there isn't one.
    /// Fails with `NoFreeRecord` if a new entry is needed and the table is
    /// full.
    pub(crate) fn get_or_insert_with(
        &mut self,
        id: TaskId,
        make: impl FnOnce() -> T,
    ) -> Result<&mut T, KernError> {
        let i = match self.position(id) {
            Ok(i) => i,
            Err(i) => {
                self.contents
                    .insert(i, (id, make()))
                    .map_err(|_| KernError::NoFreeRecord)?;
                i
            }
        };
        Ok(&mut self.contents[i].1)
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<T> {
        let i = self.position(id).ok()?;
        Some(self.contents.remove(i).1)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.contents.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (TaskId, &T)> + '_ {
        self.contents.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_insert_out_of_order() {
        let mut t: IdTable<u8, 4> = IdTable::new();
        *t.get_or_insert_with(TaskId(5), || 0).unwrap() = 50;
        *t.get_or_insert_with(TaskId(2), || 0).unwrap() = 20;
        *t.get_or_insert_with(TaskId(9), || 0).unwrap() = 90;
        assert_eq!(t.get(TaskId(2)), Some(&20));
        assert_eq!(t.get(TaskId(5)), Some(&50));
        assert_eq!(t.get(TaskId(7)), None);
        let keys: Vec<u32> = t.iter().map(|(k, _)| k.0).collect();
        assert_eq!(keys, [2, 5, 9]);
    }

    #[test]
    fn existing_entry_is_not_remade() {
        let mut t: IdTable<u8, 2> = IdTable::new();
        *t.get_or_insert_with(TaskId(1), || 7).unwrap() += 1;
        let v = t.get_or_insert_with(TaskId(1), || 0).unwrap();
        assert_eq!(*v, 8);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn full_table_refuses_new_keys_only() {
        let mut t: IdTable<u8, 2> = IdTable::new();
        t.get_or_insert_with(TaskId(1), || 1).unwrap();
        t.get_or_insert_with(TaskId(2), || 2).unwrap();
        assert_eq!(
            t.get_or_insert_with(TaskId(3), || 3).err(),
            Some(KernError::NoFreeRecord)
        );
        assert!(t.get_or_insert_with(TaskId(2), || 0).is_ok());
        assert_eq!(t.remove(TaskId(1)), Some(1));
        assert!(t.get_or_insert_with(TaskId(3), || 3).is_ok());
    }
}
