use std::collections::{BTreeMap, BTreeSet};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::base::{BufLoc, Key, Payload};
use crate::error::{Error, Result};

/// Directory record naming one group's key-set payload. `offset` is
/// relative to the end of the directory header.
#[derive(Debug, Serialize, Deserialize)]
struct DirEntry {
    name: String,
    offset: u32,
    length: u32,
}

/// A named set of keys. Groups reference entries, they never own them;
/// a key may appear in any number of groups.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    pub(crate) keys: Payload<BTreeSet<Key>>,
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` until fetched.
    pub fn keys(&self) -> Option<&BTreeSet<Key>> {
        self.keys.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.keys.is_loaded()
    }
}

/// The group table: an eagerly read directory over lazily fetched key
/// sets. Name order is the directory order, which keeps repeat saves
/// byte-identical.
#[derive(Debug, Default)]
pub struct Groups {
    entries: BTreeMap<String, Group>,
}

impl Groups {
    pub fn new() -> Self {
        Groups::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Group names in lexicographic order.
    pub fn list(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Group> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownGroup(name.to_string()))
    }

    /// Union the keys into the named group, creating it if absent. The
    /// caller validates the keys and loads the group's payload first.
    pub(crate) fn insert_keys(&mut self, name: &str, keys: impl IntoIterator<Item = Key>) {
        let group = self.entries.entry(name.to_string()).or_insert_with(|| Group {
            name: name.to_string(),
            keys: Payload::Loaded(BTreeSet::new()),
        });
        group
            .keys
            .get_mut()
            .expect("group payload should be loaded before mutation")
            .extend(keys);
    }

    /// Load the named groups' key sets out of the groups block.
    /// Already-loaded groups are left alone.
    pub(crate) fn fetch(&mut self, block: &[u8], names: &[String], table_len: usize) -> Result<()> {
        for name in names {
            let group = self
                .entries
                .get_mut(name.as_str())
                .ok_or_else(|| Error::UnknownGroup(name.clone()))?;

            let Some(loc) = group.keys.loc() else {
                continue;
            };

            let payload = loc.slice(block)?;
            if payload.len() % 4 != 0 {
                return Err(Error::CorruptLayout(format!(
                    "group {:?} payload of {} bytes is not a multiple of 4",
                    name,
                    payload.len()
                )));
            }

            let mut keys = BTreeSet::new();
            for chunk in payload.chunks_exact(4) {
                let key = LittleEndian::read_u32(chunk);
                if key as usize >= table_len {
                    return Err(Error::DanglingKey {
                        group: name.clone(),
                        key,
                    });
                }
                keys.insert(key);
            }
            group.keys = Payload::Loaded(keys);
        }
        Ok(())
    }

    /// Names of every group whose payload is still unloaded.
    pub(crate) fn unloaded_names(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|group| !group.is_loaded())
            .map(|group| group.name.clone())
            .collect()
    }

    /// Union of the named groups' key sets. All named groups must have
    /// been fetched.
    pub(crate) fn union_keys(&self, names: &[String]) -> Result<BTreeSet<Key>> {
        let mut out = BTreeSet::new();
        for name in names {
            let group = self.get(name)?;
            let keys = group
                .keys()
                .expect("group payload should be loaded before union");
            out.extend(keys.iter().copied());
        }
        Ok(out)
    }

    /// Decode the directory. Key-set payloads stay unloaded; their
    /// locations are rebased to the block start.
    pub(crate) fn load(block: &[u8]) -> Result<Self> {
        if block.is_empty() {
            return Ok(Groups::default());
        }
        if block.len() < 4 {
            return Err(Error::CorruptLayout(
                "groups block too short for its directory header".to_string(),
            ));
        }

        let dir_len = LittleEndian::read_u32(&block[..4]) as usize;
        let payload_base = 4 + dir_len;
        if payload_base > block.len() {
            return Err(Error::CorruptLayout(format!(
                "groups directory of {} bytes exceeds block of {} bytes",
                dir_len,
                block.len()
            )));
        }

        let dir: Vec<DirEntry> = serde_json::from_slice(&block[4..payload_base])?;

        let mut entries = BTreeMap::new();
        for record in dir {
            let loc = BufLoc::new(payload_base as u32 + record.offset, record.length);
            if loc.end() > block.len() as u64 {
                return Err(Error::CorruptLayout(format!(
                    "group {:?} payload exceeds the groups block",
                    record.name
                )));
            }
            entries.insert(
                record.name.clone(),
                Group {
                    name: record.name,
                    keys: Payload::Unloaded(loc),
                },
            );
        }

        Ok(Groups { entries })
    }

    /// Serialize the directory and payloads. Key sets dump deduplicated
    /// and sorted; an empty table dumps to nothing. All payloads must
    /// have been fetched.
    pub(crate) fn dump(&self) -> Vec<u8> {
        if self.entries.is_empty() {
            return Vec::new();
        }

        let mut payloads = Vec::new();
        let mut dir = Vec::with_capacity(self.entries.len());
        for group in self.entries.values() {
            let keys = group
                .keys()
                .expect("group payload should be loaded before dump");
            let offset = payloads.len() as u32;
            for key in keys {
                payloads.write_u32::<LittleEndian>(*key).expect("vec write");
            }
            dir.push(DirEntry {
                name: group.name.clone(),
                offset,
                length: (keys.len() * 4) as u32,
            });
        }

        let dir_json = serde_json::to_vec(&dir).expect("directory serialization");
        let mut buf = Vec::with_capacity(4 + dir_json.len() + payloads.len());
        buf.write_u32::<LittleEndian>(dir_json.len() as u32).expect("vec write");
        buf.extend_from_slice(&dir_json);
        buf.extend_from_slice(&payloads);
        buf
    }
}
