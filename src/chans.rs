//! Shared-memory export channels.
//!
//! A channel set is a single memory-mapped file: a small header followed by
//! a heap of variable-size channel blocks, each holding a ring of
//! `(timestamp, value)` samples plus its name, description and unit strings.
//! The publishing process appends samples from the emit path; any number of
//! subscriber processes map the same file and poll the rings with their own
//! cursors.
//!
//! Everything inside the file is addressed by byte offset from the start of
//! the mapping. The mapping can relocate when the file grows, so a live
//! pointer is always `base + offset` computed at the moment of use, never
//! cached.

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use memmap2::MmapMut;

use crate::ringbuf::{CatchUp, RawRing};

/// Identifies a channel-set file. The same value doubles as the
/// "exported only" trace sentinel on recorders.
pub const CHAN_MAGIC: u32 = 0xC0DA_BABE;

/// Bumped whenever the file layout changes.
pub const CHAN_VERSION: u32 = 1;

/// The file grows in whole 4 KiB pages.
const MAP_SIZE: u64 = 4096;

/// Block alignment inside the file, enough for the widest scalar.
const ALLOC_ALIGN: u64 = 16;

/// Data type carried by a channel, inferred from the format string by the
/// first writer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanType {
    None = 0,
    Invalid = 1,
    Signed = 2,
    Unsigned = 3,
    Real = 4,
}

impl ChanType {
    fn from_u32(v: u32) -> ChanType {
        match v {
            0 => ChanType::None,
            2 => ChanType::Signed,
            3 => ChanType::Unsigned,
            4 => ChanType::Real,
            _ => ChanType::Invalid,
        }
    }
}

/// One word of channel data, reinterpreted according to [`ChanType`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union ChanData {
    pub signed_value: isize,
    pub unsigned_value: usize,
    #[cfg(target_pointer_width = "64")]
    pub real_value: f64,
    #[cfg(target_pointer_width = "32")]
    pub real_value: f32,
}

impl ChanData {
    pub fn signed(v: isize) -> Self {
        ChanData { signed_value: v }
    }

    pub fn unsigned(v: usize) -> Self {
        ChanData { unsigned_value: v }
    }
}

impl Default for ChanData {
    fn default() -> Self {
        ChanData { unsigned_value: 0 }
    }
}

/// One exported sample: timestamp, then the argument word.
pub type Sample = [ChanData; 2];

/// File header. Written by the owning process; subscribers treat it as
/// read-only.
#[repr(C)]
struct SetHeader {
    magic: u32,
    version: u32,
    head: u64,
    free_list: u64,
    offset: u64,
}

/// Channel block header. The ring item array follows immediately, then the
/// three NUL-terminated strings; all four are addressed by offsets relative
/// to this header so the block is position independent.
#[repr(C)]
struct Shan {
    chan_type: AtomicU32,
    _pad: u32,
    next: u64,
    name: u64,
    description: u64,
    unit: u64,
    min: ChanData,
    max: ChanData,
    ring: RawRing,
}

/// Handle to one channel: an offset into the set's mapping. Copyable and
/// immune to relocation because every access re-derives the live address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chan {
    offset: u64,
}

/// A mapped channel set: the publisher side (created with [`Chans::create`])
/// or a subscriber (opened with [`Chans::open`]).
///
/// Returned boxed so that export hooks installed on recorders can keep a
/// stable pointer to the set across moves of the owning slot.
pub struct Chans {
    file: std::fs::File,
    map: MmapMut,
    base: AtomicPtr<u8>,
    map_len: AtomicUsize,
    handles: Vec<Chan>,
    owner: bool,
}

impl Chans {
    /// Create (truncating) the shared file at `path` and initialise an empty
    /// channel set in it.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Box<Chans>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("creating channel file {}", path.display()))?;
        file.set_len(MAP_SIZE)
            .with_context(|| format!("sizing channel file {}", path.display()))?;
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mapping channel file {}", path.display()))?;

        let mut chans = Box::new(Chans {
            file,
            map,
            base: AtomicPtr::new(ptr::null_mut()),
            map_len: AtomicUsize::new(0),
            handles: Vec::new(),
            owner: true,
        });
        chans.base.store(chans.map.as_mut_ptr(), Ordering::Release);
        chans.map_len.store(chans.map.len(), Ordering::Release);

        unsafe {
            let header = chans.header();
            ptr::write(
                header,
                SetHeader {
                    magic: CHAN_MAGIC,
                    version: CHAN_VERSION,
                    head: 0,
                    free_list: 0,
                    offset: mem::size_of::<SetHeader>() as u64,
                },
            );
        }
        Ok(chans)
    }

    /// Map an existing channel set and build handles for every channel in
    /// it. Fails on a missing file or a magic/version mismatch.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Box<Chans>> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening channel file {}", path.display()))?;
        let len = file.metadata()?.len();
        if len < mem::size_of::<SetHeader>() as u64 {
            bail!("channel file {} is too short", path.display());
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mapping channel file {}", path.display()))?;

        let mut chans = Box::new(Chans {
            file,
            map,
            base: AtomicPtr::new(ptr::null_mut()),
            map_len: AtomicUsize::new(0),
            handles: Vec::new(),
            owner: false,
        });
        chans.base.store(chans.map.as_mut_ptr(), Ordering::Release);
        chans.map_len.store(chans.map.len(), Ordering::Release);

        unsafe {
            let header = chans.header();
            if (*header).magic != CHAN_MAGIC {
                bail!("{} is not a channel file", path.display());
            }
            if (*header).version != CHAN_VERSION {
                bail!(
                    "channel file {} has version {}, expected {}",
                    path.display(),
                    (*header).version,
                    CHAN_VERSION
                );
            }
            let mut off = (*header).head;
            while off != 0 {
                chans.handles.push(Chan { offset: off });
                off = (*chans.shan(off)).next;
            }
        }
        Ok(chans)
    }

    fn base_ptr(&self) -> *mut u8 {
        self.base.load(Ordering::Acquire)
    }

    unsafe fn header(&self) -> *mut SetHeader {
        self.base_ptr() as *mut SetHeader
    }

    unsafe fn shan(&self, offset: u64) -> *mut Shan {
        self.base_ptr().add(offset as usize) as *mut Shan
    }

    unsafe fn items(&self, offset: u64) -> *mut Sample {
        self.base_ptr()
            .add(offset as usize + mem::size_of::<Shan>()) as *mut Sample
    }

    /// Extend the file so that `needed` bytes fit, and remap. The mapping
    /// base may change; offset-based handles survive, raw pointers do not.
    fn grow(&mut self, needed: u64) -> Result<()> {
        let new_len = (needed / MAP_SIZE + 1) * MAP_SIZE;
        self.file
            .set_len(new_len)
            .context("extending channel file")?;
        let mut new_map =
            unsafe { MmapMut::map_mut(&self.file) }.context("remapping channel file")?;
        self.base.store(new_map.as_mut_ptr(), Ordering::Release);
        self.map_len.store(new_map.len(), Ordering::Release);
        self.map = new_map;
        Ok(())
    }

    /// Pop the first free block large enough for `alloc` bytes, if any.
    fn take_free_block(&mut self, alloc: u64) -> Option<u64> {
        unsafe {
            let header = self.header();
            let mut link: *mut u64 = &mut (*header).free_list;
            while *link != 0 {
                let off = *link;
                let shan = self.shan(off);
                let unit_offs = (*shan).unit;
                let unit = CStr::from_ptr((shan as *const u8).add(unit_offs as usize).cast());
                let usable = unit_offs + unit.to_bytes().len() as u64 + 1;
                if usable >= alloc {
                    *link = (*shan).next;
                    return Some(off);
                }
                link = &mut (*shan).next;
            }
        }
        None
    }

    /// Allocate a channel of `size` samples in the set. Publisher only.
    pub fn chan_new(
        &mut self,
        chan_type: ChanType,
        size: u64,
        name: &str,
        description: &str,
        unit: &str,
        min: ChanData,
        max: ChanData,
    ) -> Result<Chan> {
        let size = size.max(1).next_power_of_two();
        let item_size = mem::size_of::<Sample>() as u64;
        let name_offs = mem::size_of::<Shan>() as u64 + size * item_size;
        let descr_offs = name_offs + name.len() as u64 + 1;
        let unit_offs = descr_offs + description.len() as u64 + 1;
        let alloc = unit_offs + unit.len() as u64 + 1;

        let offset = match self.take_free_block(alloc) {
            Some(off) => off,
            None => {
                let offset = unsafe { (*self.header()).offset };
                let new_offset = (offset + alloc + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1);
                if new_offset >= self.map_len.load(Ordering::Acquire) as u64 {
                    self.grow(new_offset)?;
                }
                unsafe {
                    (*self.header()).offset = new_offset;
                }
                offset
            }
        };

        unsafe {
            let shan = self.shan(offset);
            ptr::write(
                shan,
                Shan {
                    chan_type: AtomicU32::new(chan_type as u32),
                    _pad: 0,
                    next: (*self.header()).head,
                    name: name_offs,
                    description: descr_offs,
                    unit: unit_offs,
                    min,
                    max,
                    ring: RawRing::new(size, item_size),
                },
            );
            let base = shan as *mut u8;
            copy_cstr(base.add(name_offs as usize), name);
            copy_cstr(base.add(descr_offs as usize), description);
            copy_cstr(base.add(unit_offs as usize), unit);
            (*self.header()).head = offset;
        }

        let chan = Chan { offset };
        self.handles.push(chan);
        Ok(chan)
    }

    /// Unlink a channel from the set and push its block onto the free list.
    /// The samples stay in the file but are no longer discoverable.
    pub fn chan_delete(&mut self, chan: Chan) {
        unsafe {
            let header = self.header();
            let mut link: *mut u64 = &mut (*header).head;
            while *link != 0 {
                let shan = self.shan(*link);
                if *link == chan.offset {
                    *link = (*shan).next;
                    (*shan).next = (*header).free_list;
                    (*header).free_list = chan.offset;
                    break;
                }
                link = &mut (*shan).next;
            }
        }
        self.handles.retain(|c| c.offset != chan.offset);
    }

    /// Owner teardown: detach every recorder still exporting, unlink every
    /// channel into the free list, then unmap and close.
    pub fn delete(mut self: Box<Self>) {
        for rec in crate::recorder::recorders() {
            crate::record!(
                DELETING,
                "Recorder %p trace 0x%lX",
                rec as *const crate::recorder::Recorder,
                rec.trace()
            );
            if rec.trace() == crate::recorder::TRACE_EXPORTED {
                rec.set_trace(0);
            }
            for slot in &rec.exported {
                let old = slot.swap(ptr::null_mut(), Ordering::AcqRel);
                if !old.is_null() {
                    drop(unsafe { Box::from_raw(old) });
                }
            }
        }
        for chan in self.handles.clone() {
            crate::record!(DELETING, "Channel at offset %lu", chan.offset as usize);
            self.chan_delete(chan);
        }
        // Dropping self unmaps and closes; the file itself is kept.
    }

    /// Find the next channel (after `after`, if given) whose name fully
    /// matches `pattern`, case-insensitive.
    pub fn find(&self, pattern: &str, after: Option<Chan>) -> Option<Chan> {
        let re = crate::dump::full_match_regex(pattern).ok()?;
        let start = match after {
            Some(a) => self
                .handles
                .iter()
                .position(|c| c.offset == a.offset)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        self.handles[start..]
            .iter()
            .copied()
            .find(|c| re.is_match(&self.chan_name(*c)))
    }

    /// All channels currently known to this mapping, newest first.
    pub fn channels(&self) -> &[Chan] {
        &self.handles
    }

    fn chan_str(&self, chan: Chan, which: fn(&Shan) -> u64) -> String {
        unsafe {
            let shan = self.shan(chan.offset);
            let offs = which(&*shan);
            let p = (shan as *const u8).add(offs as usize);
            CStr::from_ptr(p.cast()).to_string_lossy().into_owned()
        }
    }

    pub fn chan_name(&self, chan: Chan) -> String {
        self.chan_str(chan, |s| s.name)
    }

    pub fn chan_description(&self, chan: Chan) -> String {
        self.chan_str(chan, |s| s.description)
    }

    pub fn chan_unit(&self, chan: Chan) -> String {
        self.chan_str(chan, |s| s.unit)
    }

    pub fn chan_type(&self, chan: Chan) -> ChanType {
        unsafe { ChanType::from_u32((*self.shan(chan.offset)).chan_type.load(Ordering::Acquire)) }
    }

    pub fn chan_min(&self, chan: Chan) -> ChanData {
        unsafe { (*self.shan(chan.offset)).min }
    }

    pub fn chan_max(&self, chan: Chan) -> ChanData {
        unsafe { (*self.shan(chan.offset)).max }
    }

    pub fn chan_size(&self, chan: Chan) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.size() }
    }

    pub fn chan_item_size(&self, chan: Chan) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.item_size() }
    }

    /// Samples committed past a subscriber cursor, clamped to the ring size.
    pub fn chan_readable(&self, chan: Chan, cursor: u64) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.readable_from(cursor) }
    }

    /// Read samples at a subscriber-owned cursor; `Err(CatchUp)` means the
    /// cursor was lapped and snapped forward, discard and retry.
    pub fn chan_read(
        &self,
        chan: Chan,
        out: &mut [Sample],
        cursor: &mut u64,
    ) -> Result<u64, CatchUp> {
        unsafe {
            (*self.shan(chan.offset))
                .ring
                .read_cursor(self.items(chan.offset), out, cursor)
        }
    }

    pub fn chan_reader(&self, chan: Chan) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.reader() }
    }

    pub fn chan_writer(&self, chan: Chan) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.writer() }
    }

    pub fn chan_write(&self, chan: Chan, samples: &[Sample]) -> u64 {
        unsafe {
            (*self.shan(chan.offset))
                .ring
                .write(self.items(chan.offset), samples)
        }
    }

    pub fn chan_writable(&self, chan: Chan) -> u64 {
        unsafe { (*self.shan(chan.offset)).ring.writable() }
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

unsafe fn copy_cstr(dst: *mut u8, s: &str) {
    ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
    *dst.add(s.len()) = 0;
}

/// Per-slot export hook installed on a recorder: a channel reached through
/// the owning set so the emit path can push `(timestamp, arg)` samples.
pub(crate) struct Export {
    chans: *const Chans,
    offset: u64,
}

unsafe impl Send for Export {}
unsafe impl Sync for Export {}

impl Export {
    pub(crate) fn new(chans: *const Chans, chan: Chan) -> Export {
        Export {
            chans,
            offset: chan.offset,
        }
    }

    pub(crate) fn chan(&self) -> Chan {
        Chan {
            offset: self.offset,
        }
    }

    /// Push one sample from the emit path. Installs the channel type on
    /// first use, inferred from the format conversion for this slot.
    pub(crate) fn push_sample(
        &self,
        timestamp: u64,
        arg: usize,
        format: &'static str,
        index: usize,
    ) {
        unsafe {
            let chans = &*self.chans;
            let shan = chans.shan(self.offset);
            if (*shan)
                .chan_type
                .compare_exchange(
                    ChanType::None as u32,
                    ChanType::Invalid as u32,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let inferred = crate::format::type_from_format(format, index);
                (*shan).chan_type.store(inferred as u32, Ordering::Release);
            }
            let sample: Sample = [
                ChanData::unsigned(timestamp as usize),
                ChanData::unsigned(arg),
            ];
            (*shan).ring.write(chans.items(self.offset), &[sample]);
        }
    }
}

crate::recorder!(pub(crate) DELETING, "deleting", 32, "Deleting shared memory operations");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chans");
        let mut owner = Chans::create(&path).unwrap();
        let chan = owner
            .chan_new(
                ChanType::Signed,
                16,
                "speed",
                "vehicle speed",
                "km/h",
                ChanData::signed(0),
                ChanData::signed(200),
            )
            .unwrap();
        owner.chan_write(
            chan,
            &[[ChanData::unsigned(1), ChanData::signed(42) ]],
        );

        let sub = Chans::open(&path).unwrap();
        let found = sub.find("spee.*", None).expect("channel not found");
        assert_eq!(sub.chan_name(found), "speed");
        assert_eq!(sub.chan_description(found), "vehicle speed");
        assert_eq!(sub.chan_unit(found), "km/h");
        assert_eq!(sub.chan_type(found), ChanType::Signed);
        assert_eq!(sub.chan_size(found), 16);

        let mut cursor = 0u64;
        let mut out = [Sample::default(); 4];
        assert_eq!(sub.chan_read(found, &mut out, &mut cursor), Ok(1));
        unsafe {
            assert_eq!(out[0][0].unsigned_value, 1);
            assert_eq!(out[0][1].signed_value, 42);
        }
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        assert!(Chans::open(&path).is_err());
    }

    #[test]
    fn test_growth_relocates_without_breaking_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chans");
        let mut owner = Chans::create(&path).unwrap();
        let first = owner
            .chan_new(
                ChanType::None,
                8,
                "first",
                "",
                "",
                ChanData::default(),
                ChanData::default(),
            )
            .unwrap();
        // Each of these is several pages, forcing repeated growth.
        for i in 0..4 {
            let name = format!("big{i}");
            owner
                .chan_new(
                    ChanType::None,
                    1024,
                    &name,
                    "filler",
                    "",
                    ChanData::default(),
                    ChanData::default(),
                )
                .unwrap();
        }
        assert_eq!(owner.chan_name(first), "first");
        assert_eq!(owner.chan_size(first), 8);
        let file_len = std::fs::metadata(&path).unwrap().len();
        assert!(file_len > MAP_SIZE);
        assert_eq!(file_len % MAP_SIZE, 0);
    }

    #[test]
    fn test_free_list_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chans");
        let mut owner = Chans::create(&path).unwrap();
        let victim = owner
            .chan_new(
                ChanType::None,
                64,
                "victim",
                "to be deleted",
                "",
                ChanData::default(),
                ChanData::default(),
            )
            .unwrap();
        let end_before = unsafe { (*owner.header()).offset };
        owner.chan_delete(victim);
        assert!(owner.find("victim", None).is_none());

        // A smaller channel fits in the freed block: no new allocation.
        let reused = owner
            .chan_new(
                ChanType::None,
                16,
                "reuse",
                "",
                "",
                ChanData::default(),
                ChanData::default(),
            )
            .unwrap();
        assert_eq!(unsafe { (*owner.header()).offset }, end_before);
        assert_eq!(owner.chan_name(reused), "reuse");

        // One that does not fit falls back to bumping.
        let bumped = owner
            .chan_new(
                ChanType::None,
                4096,
                "bumped",
                "",
                "",
                ChanData::default(),
                ChanData::default(),
            )
            .unwrap();
        assert!(unsafe { (*owner.header()).offset } > end_before);
        assert_eq!(owner.chan_name(bumped), "bumped");
    }
}
