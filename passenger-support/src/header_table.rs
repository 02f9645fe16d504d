// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A small open-addressed hash table for HTTP headers.
//!
//! Header names are compared case-insensitively. Inserting a header that is already present
//! merges the values: `Set-Cookie` values are joined with a line feed, `Cookie` values with a
//! semicolon and everything else with a comma. Merged values aren’t concatenated until somebody
//! asks for the complete value.

use bytes::{Bytes, BytesMut};

/// Initial and minimal number of slots
pub const DEFAULT_SIZE: usize = 8;

/// A string value assembled from multiple parts on demand
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LazyString {
    parts: Vec<Bytes>,
    len: usize,
}

impl LazyString {
    /// Creates a value consisting of a single part.
    pub fn new(value: impl Into<Bytes>) -> Self {
        let value = value.into();
        Self {
            len: value.len(),
            parts: vec![value],
        }
    }

    /// Adds a part to the value, separated from the existing parts by `separator`.
    pub fn append(&mut self, separator: &'static [u8], value: impl Into<Bytes>) {
        let value = value.into();
        if !self.parts.is_empty() && !separator.is_empty() {
            self.len += separator.len();
            self.parts.push(Bytes::from_static(separator));
        }
        self.len += value.len();
        self.parts.push(value);
    }

    /// Length of the complete value in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Checks whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The parts this value consists of, including separators.
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Produces the complete value.
    pub fn to_bytes(&self) -> Bytes {
        match self.parts.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            parts => {
                let mut result = BytesMut::with_capacity(self.len);
                for part in parts {
                    result.extend_from_slice(part);
                }
                result.freeze()
            }
        }
    }
}

/// Separator used when merging repeated values of the header `name`
pub fn merge_separator(name: &[u8]) -> &'static [u8] {
    if name.eq_ignore_ascii_case(b"set-cookie") {
        b"\n"
    } else if name.eq_ignore_ascii_case(b"cookie") {
        b";"
    } else {
        b","
    }
}

fn hash_name(name: &[u8]) -> u32 {
    // FNV-1a over the lower-cased name
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name {
        hash ^= u32::from(byte.to_ascii_lowercase());
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug, Clone)]
struct Slot {
    hash: u32,
    name: Bytes,
    value: LazyString,
}

/// Open-addressed header map
#[derive(Debug, Clone)]
pub struct HeaderTable {
    slots: Vec<Option<Slot>>,
    size: usize,
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderTable {
    /// Creates an empty table with [`DEFAULT_SIZE`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIZE)
    }

    /// Creates an empty table able to hold `capacity` headers without growing. The number of
    /// slots is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = capacity.max(DEFAULT_SIZE).next_power_of_two();
        Self {
            slots: vec![None; slots],
            size: 0,
        }
    }

    /// Number of distinct headers in the table
    pub fn len(&self) -> usize {
        self.size
    }

    /// Checks whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of slots, always a power of two
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Probes for `name`, returning either its slot or the empty slot where it would go.
    fn find_slot(&self, name: &[u8], hash: u32) -> usize {
        let mask = self.slots.len() - 1;
        let mut index = hash as usize & mask;
        let mut step = 0;
        loop {
            match &self.slots[index] {
                None => return index,
                Some(slot) if slot.hash == hash && slot.name.eq_ignore_ascii_case(name) => {
                    return index
                }
                Some(_) => {
                    step += 1;
                    index = (index + step) & mask;
                }
            }
        }
    }

    fn grow(&mut self) {
        let new_size = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; new_size]);
        for slot in old.into_iter().flatten() {
            let index = self.find_slot(&slot.name, slot.hash);
            self.slots[index] = Some(slot);
        }
    }

    /// Inserts a header, merging the value with an existing one according to the header name.
    pub fn insert(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        let name = name.into();
        let separator = merge_separator(&name);
        self.insert_with(name, value, |existing, value| {
            existing.append(separator, value)
        });
    }

    /// Inserts a header, calling `merge` if a header with the same name is already present.
    pub fn insert_with<F>(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>, merge: F)
    where
        F: FnOnce(&mut LazyString, Bytes),
    {
        let name = name.into();
        let value = value.into();
        let hash = hash_name(&name);

        let mut index = self.find_slot(&name, hash);
        if let Some(slot) = &mut self.slots[index] {
            merge(&mut slot.value, value);
            return;
        }

        if (self.size + 1) * 4 > self.slots.len() * 3 {
            self.grow();
            index = self.find_slot(&name, hash);
        }
        self.slots[index] = Some(Slot {
            hash,
            name,
            value: LazyString::new(value),
        });
        self.size += 1;
    }

    /// Looks up the merged value of a header.
    pub fn lookup(&self, name: impl AsRef<[u8]>) -> Option<&LazyString> {
        let name = name.as_ref();
        let index = self.find_slot(name, hash_name(name));
        self.slots[index].as_ref().map(|slot| &slot.value)
    }

    /// Checks whether a header is present.
    pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
        self.lookup(name).is_some()
    }

    /// Removes all headers and shrinks the table back to [`DEFAULT_SIZE`] slots.
    pub fn clear(&mut self) {
        self.slots = vec![None; DEFAULT_SIZE];
        self.size = 0;
    }

    /// Iterates over all headers as name and merged value.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &LazyString)> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| (&slot.name, &slot.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(table: &HeaderTable, name: &str) -> Option<Bytes> {
        table.lookup(name).map(LazyString::to_bytes)
    }

    #[test]
    fn duplicate_headers() {
        let mut table = HeaderTable::new();
        table.insert("X-Forwarded-For", "a");
        table.insert("X-Forwarded-For", "b");
        table.insert("Cookie", "s=1");
        table.insert("Cookie", "t=2");
        table.insert("Set-Cookie", "u=3");
        table.insert("Set-Cookie", "v=4");

        assert_eq!(table.len(), 3);
        assert_eq!(value(&table, "X-Forwarded-For").unwrap(), "a,b");
        assert_eq!(value(&table, "Cookie").unwrap(), "s=1;t=2");
        assert_eq!(value(&table, "Set-Cookie").unwrap(), "u=3\nv=4");
        assert_eq!(value(&table, "set-cookie").unwrap(), "u=3\nv=4");
        assert_eq!(table.lookup("Set-Cookie").unwrap().len(), 7);
        assert!(value(&table, "Host").is_none());
    }

    #[test]
    fn custom_merge() {
        let mut table = HeaderTable::new();
        table.insert("Status", "200 OK");
        table.insert_with("Status", "404 Not Found", |existing, value| {
            *existing = LazyString::new(value)
        });
        assert_eq!(value(&table, "status").unwrap(), "404 Not Found");
    }

    #[test]
    fn growth() {
        let mut table = HeaderTable::new();
        assert_eq!(table.capacity(), DEFAULT_SIZE);

        let mut previous = table.capacity();
        for i in 0..100 {
            table.insert(format!("X-Header-{i}"), format!("{i}"));
            table.insert(format!("x-header-{i}"), "again");

            let capacity = table.capacity();
            assert!(capacity.is_power_of_two());
            assert!(capacity >= previous);
            assert!(table.len() * 4 <= capacity * 3);
            previous = capacity;
        }
        assert_eq!(table.len(), 100);
        assert_eq!(table.iter().count(), 100);
        for i in 0..100 {
            assert_eq!(
                value(&table, &format!("X-HEADER-{i}")).unwrap(),
                format!("{i},again")
            );
        }

        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), DEFAULT_SIZE);
        assert!(!table.contains("X-Header-1"));
    }
}
