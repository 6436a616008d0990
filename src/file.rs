use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use memmap2::Mmap;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::base::{BufLoc, Key, Payload};
use crate::error::{Error, Result};
use crate::groups::Groups;
use crate::header::{FORMAT_VERSION, HEADER_LEN, Header};
use crate::iid::{self, Iid};
use crate::lut::{Entry, LookupTable, LUT_STRIDE, Slot};
use crate::meta::Metadata;
use crate::segment::{self, Segment};

/// Options for [`IidFile::open_with`]. Naming groups restricts the
/// lookup table to those groups' keys; everything else in the file is
/// left unmaterialized but survives a save.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub groups: Vec<String>,
}

/// Selector for [`IidFile::fetch`].
///
/// Resolution order: `everything` wins, then `groups`, then `all_keys`,
/// then the explicit `keys`. Identifier bytes are materialized iff
/// `iids`, segment payloads iff `segs`; `everything` forces both and
/// loads every group's key set as well.
#[derive(Debug, Clone, Default)]
pub struct Fetch {
    pub keys: Vec<Key>,
    pub all_keys: bool,
    pub groups: Vec<String>,
    pub iids: bool,
    pub segs: bool,
    pub everything: bool,
}

impl Fetch {
    pub fn keys(keys: impl IntoIterator<Item = Key>) -> Self {
        Fetch {
            keys: keys.into_iter().collect(),
            ..Fetch::default()
        }
    }

    /// Single key, promoted to a singleton set.
    pub fn key(key: Key) -> Self {
        Fetch::keys([key])
    }

    pub fn groups(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Fetch {
            groups: names.into_iter().map(Into::into).collect(),
            ..Fetch::default()
        }
    }

    pub fn all() -> Self {
        Fetch {
            all_keys: true,
            ..Fetch::default()
        }
    }

    pub fn everything() -> Self {
        Fetch {
            everything: true,
            ..Fetch::default()
        }
    }

    pub fn with_iids(mut self) -> Self {
        self.iids = true;
        self
    }

    pub fn with_segs(mut self) -> Self {
        self.segs = true;
        self
    }
}

/// Options for [`IidFile::find`].
#[derive(Debug, Clone, Default)]
pub struct Find {
    /// Restrict the key space to these groups before matching.
    pub groups: Vec<String>,
    /// When given, an entry matches only if its domain bytes appear in
    /// the set; an empty candidate matches entries without a domain.
    pub domains: Option<Vec<Vec<u8>>>,
    /// Materialize segment payloads of the matches.
    pub segs: bool,
}

/// Options for [`IidFile::filter`].
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub groups: Vec<String>,
    /// `(min, max)` pixel-area bounds, each exclusive. A bound forces
    /// segment materialization regardless of `segs`.
    pub area: (Option<u32>, Option<u32>),
    pub domains: Option<Vec<Vec<u8>>>,
    pub segs: bool,
}

/// A `.iid` container: identifiers and their segmentation masks behind
/// a fixed-stride lookup table, memory-mapped and fetched lazily.
///
/// Single-threaded, single-writer. The map is valid for the life of the
/// instance; `save` swaps it for the newly written file.
pub struct IidFile {
    mmap: Option<Mmap>,
    header: Header,
    lut: LookupTable,
    groups: Groups,
    meta: Metadata,
}

impl IidFile {
    /// Fresh container with no backing file.
    pub fn create() -> Self {
        IidFile {
            mmap: None,
            header: Header::default(),
            lut: LookupTable::new(),
            groups: Groups::new(),
            meta: Metadata::new(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &OpenOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let header = Header::decode(&mmap)?;
        header.validate(mmap.len() as u64)?;

        let meta = Metadata::load(header.meta.slice(&mmap)?)?;
        let mut groups = Groups::load(header.groups.slice(&mmap)?)?;

        let lut_block = header.lut.slice(&mmap)?;
        let table_len = lut_block.len() / LUT_STRIDE;

        let filter = if options.groups.is_empty() {
            None
        } else {
            groups.fetch(header.groups.slice(&mmap)?, &options.groups, table_len)?;
            Some(groups.union_keys(&options.groups)?)
        };
        let lut = LookupTable::load(lut_block, filter.as_ref())?;

        debug!(
            path = %path.display(),
            entries = lut.len(),
            groups = groups.len(),
            restricted = filter.is_some(),
            "opened container"
        );

        Ok(IidFile {
            mmap: Some(mmap),
            header,
            lut,
            groups,
            meta,
        })
    }

    /// Slot count, tombstones included.
    pub fn len(&self) -> usize {
        self.lut.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lut.is_empty()
    }

    pub fn get(&self, key: Key) -> Result<&Entry> {
        self.lut.get(key)
    }

    /// Live entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.lut.slots.iter().filter_map(|slot| match slot {
            Slot::Live(entry) => Some(entry),
            _ => None,
        })
    }

    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }

    /// Append an entry, assigning the next key and writing it into both
    /// halves. Optionally tags the new key into a group.
    pub fn add(&mut self, iid: Iid, seg: Segment, group: Option<&str>) -> Result<Key> {
        let key = self.lut.append(iid, seg)?;
        if let Some(name) = group {
            self.group(name, [key])?;
        }
        trace!(key, "added entry");
        Ok(key)
    }

    /// Tombstone the slot. The key is never reused; groups referencing
    /// it keep the stale key until the entry stream is rewritten.
    pub fn remove(&mut self, key: Key) -> Result<()> {
        self.lut.remove(key)
    }

    /// Union keys into the named group, creating it if absent. Keys must
    /// name live entries.
    pub fn group(&mut self, name: &str, keys: impl IntoIterator<Item = Key>) -> Result<()> {
        // An existing group may still sit unfetched in the file; load it
        // first so the union keeps its file-resident keys.
        if self.groups.contains(name) {
            self.require_groups(&[name.to_string()])?;
        }

        let keys: Vec<Key> = keys.into_iter().collect();
        for &key in &keys {
            if !self.lut.contains(key) {
                return Err(Error::DanglingKey {
                    group: name.to_string(),
                    key,
                });
            }
        }

        self.groups.insert_keys(name, keys);
        Ok(())
    }

    /// Materialize lazy payloads and return the selected entries in key
    /// order. Repeat fetches are no-ops per payload.
    pub fn fetch(&mut self, selector: &Fetch) -> Result<Vec<&Entry>> {
        let mut want_iids = selector.iids;
        let mut want_segs = selector.segs;

        let keys: BTreeSet<Key> = if selector.everything {
            want_iids = true;
            want_segs = true;
            let names: Vec<String> = self.groups.list().iter().map(|s| s.to_string()).collect();
            self.require_groups(&names)?;
            self.lut.live_keys().collect()
        } else if !selector.groups.is_empty() {
            self.group_key_space(&selector.groups)?
        } else if selector.all_keys {
            self.lut.live_keys().collect()
        } else {
            for &key in &selector.keys {
                if !self.lut.contains(key) {
                    return Err(Error::UnknownKey(key));
                }
            }
            selector.keys.iter().copied().collect()
        };

        self.materialize(&keys, want_iids, want_segs)?;
        self.collect(keys)
    }

    /// All entries whose identifier bytes appear in `iids`, optionally
    /// restricted to groups and post-filtered by domain.
    pub fn find<I: AsRef<[u8]>>(&mut self, iids: &[I], options: &Find) -> Result<Vec<&Entry>> {
        let keys = if options.groups.is_empty() {
            self.lut.live_keys().collect()
        } else {
            self.group_key_space(&options.groups)?
        };

        self.materialize(&keys, true, false)?;

        let mut matched = BTreeSet::new();
        for &key in &keys {
            let entry = self.lut.get(key)?;
            let bytes = entry.iid.bytes().expect("identifier fetched above");
            if !iids.iter().any(|candidate| candidate.as_ref() == bytes) {
                continue;
            }
            if !domain_matches(entry, options.domains.as_deref()) {
                continue;
            }
            matched.insert(key);
        }

        if options.segs {
            self.materialize(&matched, false, true)?;
        }
        self.collect(matched)
    }

    /// All entries whose segment area lies strictly inside the given
    /// bounds, optionally restricted to groups and filtered by domain.
    pub fn filter(&mut self, options: &Filter) -> Result<Vec<&Entry>> {
        let keys: BTreeSet<Key> = if options.groups.is_empty() {
            self.lut.live_keys().collect()
        } else {
            self.group_key_space(&options.groups)?
        };

        let (min_area, max_area) = options.area;
        let need_area = min_area.is_some() || max_area.is_some();
        self.materialize(&keys, options.domains.is_some(), options.segs || need_area)?;

        let mut matched = BTreeSet::new();
        for &key in &keys {
            let entry = self.lut.get(key)?;
            if need_area {
                let area = entry.seg.area().expect("segment fetched above");
                if min_area.is_some_and(|min| area <= min) {
                    continue;
                }
                if max_area.is_some_and(|max| area >= max) {
                    continue;
                }
            }
            if !domain_matches(entry, options.domains.as_deref()) {
                continue;
            }
            matched.insert(key);
        }

        self.collect(matched)
    }

    /// Serialize the container and atomically replace `path`, then remap
    /// onto the new file. On failure the in-memory state is untouched.
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        // Canonical group dumps need every key set in memory.
        let pending = self.groups.unloaded_names();
        self.require_groups(&pending)?;

        let table_len = self.lut.len();
        let old_iid_block = match self.mmap.as_ref() {
            Some(mmap) => Some(self.header.iids.slice(mmap)?),
            None => None,
        };
        let old_seg_block = match self.mmap.as_ref() {
            Some(mmap) => Some(self.header.segs.slice(mmap)?),
            None => None,
        };

        // Payload pass. Segments and identifiers are concatenated in key
        // order; entries never materialized are copied raw out of the old
        // map, already in wire form. The lookup table is built last since
        // it records offsets into both blocks.
        let mut segs_buf = Vec::new();
        let mut iids_buf = Vec::new();
        let mut seg_locs = vec![BufLoc::default(); table_len];
        let mut iid_locs = vec![BufLoc::default(); table_len];

        for (index, slot) in self.lut.slots.iter().enumerate() {
            let key = index as Key;

            let seg_start = segs_buf.len();
            let iid_start = iids_buf.len();
            match slot {
                Slot::Tombstone => continue,
                Slot::Skipped(raw) => {
                    segs_buf.extend_from_slice(raw.seg.slice(stale_block(old_seg_block)?)?);
                    iids_buf.extend_from_slice(raw.iid.slice(stale_block(old_iid_block)?)?);
                }
                Slot::Live(entry) => {
                    match &entry.seg.state {
                        Payload::Loaded(data) => segment::encode(key, data, &mut segs_buf),
                        Payload::Unloaded(loc) => {
                            segs_buf.extend_from_slice(loc.slice(stale_block(old_seg_block)?)?);
                        }
                    }
                    match &entry.iid.state {
                        Payload::Loaded(data) => iid::encode(key, data, &mut iids_buf),
                        Payload::Unloaded(loc) => {
                            iids_buf.extend_from_slice(loc.slice(stale_block(old_iid_block)?)?);
                        }
                    }
                }
            }
            seg_locs[index] = BufLoc::new(seg_start as u32, (segs_buf.len() - seg_start) as u32);
            iid_locs[index] = BufLoc::new(iid_start as u32, (iids_buf.len() - iid_start) as u32);
        }

        let groups_buf = self.groups.dump();
        let meta_buf = self.meta.dump();
        let lut_buf = self.lut.dump(&iid_locs, &seg_locs);

        // Offset pass: blocks follow the header in fixed order; empty
        // blocks record a zero pair.
        let total = HEADER_LEN as u64
            + [&lut_buf, &iids_buf, &meta_buf, &groups_buf, &segs_buf]
                .iter()
                .map(|buf| buf.len() as u64)
                .sum::<u64>();
        if total > u32::MAX as u64 {
            return Err(Error::CorruptLayout(format!(
                "container of {} bytes exceeds the u32 addressable range",
                total
            )));
        }

        let mut cursor = HEADER_LEN as u32;
        let mut place = |len: usize| -> BufLoc {
            if len == 0 {
                BufLoc::default()
            } else {
                let loc = BufLoc::new(cursor, len as u32);
                cursor += len as u32;
                loc
            }
        };

        let header = Header {
            version: FORMAT_VERSION,
            rformat: self.header.rformat,
            lut: place(lut_buf.len()),
            iids: place(iids_buf.len()),
            meta: place(meta_buf.len()),
            groups: place(groups_buf.len()),
            segs: place(segs_buf.len()),
        };

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&lut_buf);
        out.extend_from_slice(&iids_buf);
        out.extend_from_slice(&meta_buf);
        out.extend_from_slice(&groups_buf);
        out.extend_from_slice(&segs_buf);

        // Atomic rewrite: write beside the target, then rename over it.
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        temp.write_all(&out)?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        // Commit. Old buffer views are dead from here on; everything
        // unmaterialized is rebased onto the new map.
        self.header = header;
        self.mmap = Some(mmap);
        for (index, slot) in self.lut.slots.iter_mut().enumerate() {
            match slot {
                Slot::Tombstone => {}
                Slot::Skipped(raw) => {
                    raw.iid = iid_locs[index];
                    raw.seg = seg_locs[index];
                }
                Slot::Live(entry) => {
                    if let Payload::Unloaded(loc) = &mut entry.iid.state {
                        *loc = iid_locs[index];
                    }
                    if let Payload::Unloaded(loc) = &mut entry.seg.state {
                        *loc = seg_locs[index];
                    }
                }
            }
        }

        debug!(
            path = %path.display(),
            bytes = out.len(),
            entries = table_len,
            "saved container"
        );
        Ok(())
    }

    /// Key space named by a group list: the union of their key sets,
    /// narrowed to keys that are live in this session's view.
    fn group_key_space(&mut self, names: &[String]) -> Result<BTreeSet<Key>> {
        self.require_groups(names)?;
        Ok(self
            .groups
            .union_keys(names)?
            .into_iter()
            .filter(|&key| self.lut.contains(key))
            .collect())
    }

    /// Ensure the named groups exist and have their key sets in memory.
    fn require_groups(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.groups.contains(name) {
                return Err(Error::UnknownGroup(name.clone()));
            }
        }

        let pending: Vec<String> = names
            .iter()
            .filter(|name| !self.groups.get(name).is_ok_and(|g| g.is_loaded()))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mmap = self.mmap.as_ref().ok_or_else(|| {
            Error::CorruptLayout("unloaded group payload without a backing file".to_string())
        })?;
        let block = self.header.groups.slice(mmap)?;
        self.groups.fetch(block, &pending, self.lut.len())
    }

    /// Load the requested payloads for `keys`. Already-loaded payloads
    /// are left alone.
    fn materialize(&mut self, keys: &BTreeSet<Key>, iids: bool, segs: bool) -> Result<()> {
        if !iids && !segs {
            return Ok(());
        }
        // A container that was never saved holds only loaded payloads.
        let Some(mmap) = self.mmap.as_ref() else {
            return Ok(());
        };

        let iid_block = self.header.iids.slice(mmap)?;
        let seg_block = self.header.segs.slice(mmap)?;

        let mut loaded_iids = 0usize;
        let mut loaded_segs = 0usize;
        for &key in keys {
            let entry = self.lut.get_mut(key)?;
            if iids {
                if let Some(loc) = entry.iid.state.loc() {
                    let data = iid::decode(loc.slice(iid_block)?, key)?;
                    entry.iid.state = Payload::Loaded(data);
                    loaded_iids += 1;
                }
            }
            if segs {
                if let Some(loc) = entry.seg.state.loc() {
                    let data = segment::decode(loc.slice(seg_block)?, key)?;
                    entry.seg.state = Payload::Loaded(data);
                    loaded_segs += 1;
                }
            }
        }

        if loaded_iids > 0 || loaded_segs > 0 {
            debug!(keys = keys.len(), loaded_iids, loaded_segs, "materialized payloads");
        }
        Ok(())
    }

    fn collect(&self, keys: BTreeSet<Key>) -> Result<Vec<&Entry>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.lut.get(key)?);
        }
        Ok(out)
    }
}

impl Default for IidFile {
    fn default() -> Self {
        Self::create()
    }
}

fn domain_matches(entry: &Entry, domains: Option<&[Vec<u8>]>) -> bool {
    let Some(domains) = domains else {
        return true;
    };
    let domain = entry.iid.domain().unwrap_or(&[]);
    domains.iter().any(|candidate| candidate.as_slice() == domain)
}

fn stale_block(block: Option<&[u8]>) -> Result<&[u8]> {
    block.ok_or_else(|| {
        Error::CorruptLayout("unmaterialized payload without a backing file".to_string())
    })
}
