//! Lock-free ring buffers underlying recorders and export channels.
//!
//! A ring is a bounded array of `size` fixed-size items (`size` rounded up to
//! a power of two) plus four monotonically increasing 64-bit counters. The
//! array position of counter value `i` is `i mod size`. At all times
//! `reader <= commit <= writer`, and a slot is safe to read iff
//! `commit > i >= reader`.
//!
//! Writers reserve slots with an atomic fetch-add on `writer`, copy their
//! payload, then publish by advancing `commit` in reservation order. Readers
//! claim ranges by advancing a cursor, either the ring's own shared `reader`
//! or one owned by a subscriber. Writers never stall: a write that would lap
//! an unread reader counts an overrun and forces the reader forward instead
//! of blocking.
//!
//! The counter block is `#[repr(C)]` so the same protocol drives both the
//! in-process rings owned by recorders and the rings embedded in the
//! shared-memory channel file.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// A reader cursor fell more than one ring behind the writers. The cursor
/// has been snapped forward to `writer - size`; discard and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp;

/// Counter block of a ring. The item array is supplied by the owner: inline
/// in [`Ring`], or immediately after this header inside a mapped channel.
#[repr(C)]
pub struct RawRing {
    size: u64,
    item_size: u64,
    reader: AtomicU64,
    writer: AtomicU64,
    commit: AtomicU64,
    overflow: AtomicU64,
}

impl RawRing {
    pub fn new(size: u64, item_size: u64) -> Self {
        RawRing {
            size: size.max(1).next_power_of_two(),
            item_size,
            reader: AtomicU64::new(0),
            writer: AtomicU64::new(0),
            commit: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn item_size(&self) -> u64 {
        self.item_size
    }

    pub fn reader(&self) -> u64 {
        self.reader.load(Ordering::Acquire)
    }

    pub fn writer(&self) -> u64 {
        self.writer.load(Ordering::Acquire)
    }

    pub fn commit(&self) -> u64 {
        self.commit.load(Ordering::Acquire)
    }

    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Committed items still unread by the shared reader, clamped to `size`.
    pub fn readable(&self) -> u64 {
        self.readable_from(self.reader.load(Ordering::Acquire))
    }

    /// Committed items past a subscriber-owned cursor, clamped to `size`.
    pub fn readable_from(&self, cursor: u64) -> u64 {
        self.commit
            .load(Ordering::Acquire)
            .saturating_sub(cursor)
            .min(self.size)
    }

    /// Items that can be written before lapping the shared reader.
    pub fn writable(&self) -> u64 {
        let writer = self.writer.load(Ordering::Acquire);
        let reader = self.reader.load(Ordering::Acquire);
        self.size.saturating_sub(writer.saturating_sub(reader))
    }

    /// Reserve, copy and publish `items`. Never blocks: lapping an unread
    /// reader counts an overrun and forces the reader past the overwritten
    /// window. The final commit spins until every earlier reservation has
    /// published, which is bounded by the number of in-flight writers.
    ///
    /// # Safety
    ///
    /// `base` must point to this ring's item array of `size` slots.
    pub unsafe fn write<T: Copy>(&self, base: *mut T, items: &[T]) -> u64 {
        let n = items.len() as u64;
        if n == 0 {
            return 0;
        }
        let size = self.size;
        let reserved = self.writer.fetch_add(n, Ordering::AcqRel);

        let reader = self.reader.load(Ordering::Acquire);
        if reserved + n > reader + size {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            self.reader.fetch_max(reserved + n - size, Ordering::AcqRel);
        }

        for (i, item) in items.iter().enumerate() {
            base.add(((reserved + i as u64) & (size - 1)) as usize)
                .write(*item);
        }

        // Commit in reservation order so readers never see a torn slot.
        loop {
            match self.commit.compare_exchange_weak(
                reserved,
                reserved + n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => std::hint::spin_loop(),
            }
        }
        n
    }

    /// Read up to `out.len()` items, claiming the range on the shared
    /// `reader` cursor. `Err(CatchUp)` means the cursor was lapped and has
    /// been snapped forward; the caller discards and retries.
    ///
    /// # Safety
    ///
    /// `base` must point to this ring's item array of `size` slots.
    pub unsafe fn read<T: Copy>(&self, base: *const T, out: &mut [T]) -> Result<u64, CatchUp> {
        let size = self.size;
        loop {
            let first = self.reader.load(Ordering::Acquire);
            let writer = self.writer.load(Ordering::Acquire);
            if writer.saturating_sub(first) > size {
                let _ = self.reader.compare_exchange(
                    first,
                    writer - size,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                return Err(CatchUp);
            }
            let commit = self.commit.load(Ordering::Acquire);
            let n = (out.len() as u64).min(commit.saturating_sub(first));
            if n == 0 {
                return Ok(0);
            }
            for i in 0..n {
                out[i as usize] = *base.add(((first + i) & (size - 1)) as usize);
            }
            // Writers may have lapped the range while we copied.
            if self.writer.load(Ordering::Acquire).saturating_sub(first) > size {
                continue;
            }
            if self
                .reader
                .compare_exchange(first, first + n, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(n);
            }
        }
    }

    /// Read up to `out.len()` items at a subscriber-owned cursor. The shared
    /// `reader` is untouched, so any number of independent subscribers can
    /// coexist.
    ///
    /// # Safety
    ///
    /// `base` must point to this ring's item array of `size` slots.
    pub unsafe fn read_cursor<T: Copy>(
        &self,
        base: *const T,
        out: &mut [T],
        cursor: &mut u64,
    ) -> Result<u64, CatchUp> {
        let size = self.size;
        let first = *cursor;
        let writer = self.writer.load(Ordering::Acquire);
        if writer.saturating_sub(first) > size {
            *cursor = writer - size;
            return Err(CatchUp);
        }
        let commit = self.commit.load(Ordering::Acquire);
        let n = (out.len() as u64).min(commit.saturating_sub(first));
        for i in 0..n {
            out[i as usize] = *base.add(((first + i) & (size - 1)) as usize);
        }
        let writer = self.writer.load(Ordering::Acquire);
        if writer.saturating_sub(first) > size {
            *cursor = writer - size;
            return Err(CatchUp);
        }
        *cursor = first + n;
        Ok(n)
    }

    /// Copy the oldest unread item without advancing the shared reader.
    ///
    /// # Safety
    ///
    /// `base` must point to this ring's item array of `size` slots.
    pub unsafe fn peek<T: Copy>(&self, base: *const T) -> Option<T> {
        let first = self.reader.load(Ordering::Acquire);
        let commit = self.commit.load(Ordering::Acquire);
        if commit <= first {
            return None;
        }
        Some(*base.add((first & (self.size - 1)) as usize))
    }
}

/// An owned in-process ring: the counter block plus an inline item array.
pub struct Ring<T> {
    raw: RawRing,
    items: Box<[UnsafeCell<T>]>,
}

unsafe impl<T: Copy + Send> Send for Ring<T> {}
unsafe impl<T: Copy + Send> Sync for Ring<T> {}

impl<T: Copy + Default> Ring<T> {
    pub fn new(size: usize) -> Self {
        let raw = RawRing::new(size as u64, std::mem::size_of::<T>() as u64);
        let items = (0..raw.size())
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring { raw, items }
    }
}

impl<T: Copy> Ring<T> {
    fn base(&self) -> *mut T {
        UnsafeCell::raw_get(self.items.as_ptr())
    }

    pub fn write(&self, items: &[T]) -> u64 {
        unsafe { self.raw.write(self.base(), items) }
    }

    pub fn read(&self, out: &mut [T]) -> Result<u64, CatchUp> {
        unsafe { self.raw.read(self.base(), out) }
    }

    pub fn read_cursor(&self, out: &mut [T], cursor: &mut u64) -> Result<u64, CatchUp> {
        unsafe { self.raw.read_cursor(self.base(), out, cursor) }
    }

    pub fn peek(&self) -> Option<T> {
        unsafe { self.raw.peek(self.base()) }
    }

    pub fn readable(&self) -> u64 {
        self.raw.readable()
    }

    pub fn raw(&self) -> &RawRing {
        &self.raw
    }
}
