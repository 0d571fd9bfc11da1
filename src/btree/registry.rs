//! Tree registry: the index-id -> (name, root, height) directory. Trees are
//! created, renamed, and dropped through this registry rather than each
//! carrying its own identity.
//!
//! No direct precedent elsewhere in this crate for a named multi-tree
//! directory; grounded on `store/freelist.rs`'s pattern of a small
//! fixed-format table serialized to one reserved page.

use std::collections::HashMap;

use crate::config::{IndexId, PageId, PAGE_SIZE, PID_SIZE, REGISTRY_PID};
use crate::error::{Error, Result};
use crate::store::PageStore;

use super::TreeMeta;

const MAGIC: u32 = 0x5452_4547; // "TREG"

#[derive(Clone)]
pub struct TreeEntry {
    pub index_id: IndexId,
    pub name: Option<String>,
    pub meta: TreeMeta,
}

/// The directory of live trees, persisted as a flat table in one page.
/// A multi-page chain (mirroring the fragment chain) would lift the
/// one-page limit on tree count; left as a documented simplification
/// (see DESIGN.md).
pub struct Registry {
    next_id: IndexId,
    entries: HashMap<IndexId, TreeEntry>,
}

impl Registry {
    pub fn fresh() -> Registry {
        Registry { next_id: 1, entries: HashMap::new() }
    }

    pub fn load(store: &PageStore) -> Result<Registry> {
        let mut buf = [0u8; PAGE_SIZE];
        store.read_page(REGISTRY_PID, &mut buf)?;
        Self::decode(&buf)
    }

    pub fn save(&self, store: &PageStore) -> Result<()> {
        let buf = self.encode()?;
        store.write_page(REGISTRY_PID, &buf)
    }

    fn decode(buf: &[u8; PAGE_SIZE]) -> Result<Registry> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Ok(Registry::fresh());
        }
        let next_id = u64::from_be_bytes(buf[4..12].try_into().unwrap());
        let count = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        let mut entries = HashMap::with_capacity(count);
        let mut pos = 16usize;
        for _ in 0..count {
            if pos + 8 + PID_SIZE + 4 + 2 > PAGE_SIZE {
                return Err(Error::Corrupt("registry page truncated".into()));
            }
            let index_id = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let root = PageId::from_be_bytes(buf[pos..pos + PID_SIZE].try_into().unwrap());
            pos += PID_SIZE;
            let height = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let name_len = u16::from_be_bytes(buf[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            if pos + name_len > PAGE_SIZE {
                return Err(Error::Corrupt("registry entry name truncated".into()));
            }
            let name = if name_len == 0 {
                None
            } else {
                Some(String::from_utf8(buf[pos..pos + name_len].to_vec()).map_err(|_| Error::Corrupt("registry name is not utf8".into()))?)
            };
            pos += name_len;
            entries.insert(index_id, TreeEntry { index_id, name, meta: TreeMeta { root, height } });
        }
        Ok(Registry { next_id, entries })
    }

    fn encode(&self) -> Result<[u8; PAGE_SIZE]> {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..12].copy_from_slice(&self.next_id.to_be_bytes());
        buf[12..16].copy_from_slice(&(self.entries.len() as u32).to_be_bytes());
        let mut pos = 16usize;
        for entry in self.entries.values() {
            let name_bytes = entry.name.as_deref().unwrap_or("").as_bytes();
            let need = 8 + PID_SIZE + 4 + 2 + name_bytes.len();
            if pos + need > PAGE_SIZE {
                return Err(Error::out_of_bounds("tree registry page is full"));
            }
            buf[pos..pos + 8].copy_from_slice(&entry.index_id.to_be_bytes());
            pos += 8;
            buf[pos..pos + PID_SIZE].copy_from_slice(&entry.meta.root.to_be_bytes());
            pos += PID_SIZE;
            buf[pos..pos + 4].copy_from_slice(&entry.meta.height.to_be_bytes());
            pos += 4;
            buf[pos..pos + 2].copy_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            pos += 2;
            buf[pos..pos + name_bytes.len()].copy_from_slice(name_bytes);
            pos += name_bytes.len();
        }
        Ok(buf)
    }

    pub fn create(&mut self, name: Option<String>) -> Result<IndexId> {
        if let Some(n) = &name {
            if self.find_by_name(n).is_some() {
                return Err(Error::out_of_bounds(format!("index named {n:?} already exists")));
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, TreeEntry { index_id: id, name, meta: TreeMeta::default() });
        Ok(id)
    }

    pub fn rename(&mut self, id: IndexId, name: Option<String>) -> Result<()> {
        let entry = self.entries.get_mut(&id).ok_or(Error::NoSuchValue)?;
        entry.name = name;
        Ok(())
    }

    pub fn drop_index(&mut self, id: IndexId) -> Result<TreeEntry> {
        self.entries.remove(&id).ok_or(Error::NoSuchValue)
    }

    pub fn get(&self, id: IndexId) -> Option<&TreeEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: IndexId) -> Option<&mut TreeEntry> {
        self.entries.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<IndexId> {
        self.entries.values().find(|e| e.name.as_deref() == Some(name)).map(|e| e.index_id)
    }

    pub fn index_ids(&self) -> impl Iterator<Item = IndexId> + '_ {
        self.entries.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rename_drop_round_trips_through_encode() {
        let mut reg = Registry::fresh();
        let id = reg.create(Some("widgets".into())).unwrap();
        reg.get_mut(id).unwrap().meta = TreeMeta { root: 7, height: 2 };
        let encoded = reg.encode().unwrap();
        let decoded = Registry::decode(&encoded).unwrap();
        assert_eq!(decoded.get(id).unwrap().meta.root, 7);
        assert_eq!(decoded.find_by_name("widgets"), Some(id));

        let mut decoded = decoded;
        decoded.rename(id, Some("gadgets".into())).unwrap();
        assert_eq!(decoded.find_by_name("widgets"), None);
        decoded.drop_index(id).unwrap();
        assert!(decoded.get(id).is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut reg = Registry::fresh();
        reg.create(Some("a".into())).unwrap();
        assert!(reg.create(Some("a".into())).is_err());
    }
}
