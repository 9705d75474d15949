//! Read-only view of the capture service's shared-memory present ring.
//!
//! The producer appends [`FrameRecord`]s at a fixed stride after the header
//! and publishes `head_idx` / `tail_idx` / `process_active` / `is_full` with
//! release stores; we read those four fields with acquire loads and never
//! write through the mapping.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::record::{
    FrameRecord, RingHeader, HEADER_HEAD_IDX_OFFSET, HEADER_IS_FULL_OFFSET,
    HEADER_PROCESS_ACTIVE_OFFSET, HEADER_TAIL_IDX_OFFSET, RECORD_STRIDE, RING_HEADER_SIZE,
};

/// Consistent copy of the ring header taken at one point in time.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSnapshot {
    pub start_qpc: u64,
    pub qpc_frequency: u64,
    pub max_entries: u32,
    pub head_idx: u64,
    pub tail_idx: u64,
    pub process_active: bool,
    pub is_full: bool,
}

pub struct RingView {
    map: Mmap,
}

impl RingView {
    /// Maps the named ring region read-only and validates its dimensions.
    pub fn open(path: &Path) -> Result<RingView> {
        let file = File::open(path)
            .map_err(|e| Error::Failure(format!("could not open ring {}: {e}", path.display())))?;
        // Safety: the mapping is read-only and the producer only ever
        // appends; concurrent record writes land in slots we are not allowed
        // to read yet (the slot at head_idx).
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Failure(format!("could not map ring {}: {e}", path.display())))?;
        let view = RingView { map };
        if view.map.len() < RING_HEADER_SIZE {
            return Err(Error::ServiceError);
        }
        let max_entries = view.header().max_entries as usize;
        if view.map.len() < RING_HEADER_SIZE + max_entries * RECORD_STRIDE {
            return Err(Error::ServiceError);
        }
        Ok(view)
    }

    fn base(&self) -> *const u8 {
        self.map.as_ptr()
    }

    fn atomic_u64(&self, offset: usize) -> u64 {
        // Safety: offset is within the validated header and 8-aligned; the
        // mapping base is page-aligned.
        unsafe { (*(self.base().add(offset) as *const AtomicU64)).load(Ordering::Acquire) }
    }

    fn atomic_u32(&self, offset: usize) -> u32 {
        // Safety: as above, 4-aligned.
        unsafe { (*(self.base().add(offset) as *const AtomicU32)).load(Ordering::Acquire) }
    }

    pub fn header(&self) -> HeaderSnapshot {
        // Safety: the mapping is at least RING_HEADER_SIZE bytes.
        let fixed = unsafe { std::ptr::read_unaligned(self.base() as *const RingHeader) };
        HeaderSnapshot {
            start_qpc: fixed.start_qpc,
            qpc_frequency: fixed.qpc_frequency,
            max_entries: fixed.max_entries,
            head_idx: self.atomic_u64(HEADER_HEAD_IDX_OFFSET),
            tail_idx: self.atomic_u64(HEADER_TAIL_IDX_OFFSET),
            process_active: self.atomic_u32(HEADER_PROCESS_ACTIVE_OFFSET) != 0,
            is_full: self.atomic_u32(HEADER_IS_FULL_OFFSET) != 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.atomic_u32(HEADER_IS_FULL_OFFSET) != 0
    }

    /// Copies the record in slot `idx`, or `None` when the slot is out of
    /// bounds for the mapped region.
    pub fn record(&self, idx: u64) -> Option<FrameRecord> {
        let header = self.header();
        if idx >= header.max_entries as u64 {
            return None;
        }
        let offset = RING_HEADER_SIZE + idx as usize * RECORD_STRIDE;
        // Safety: bounds were validated at open time against max_entries.
        Some(unsafe { std::ptr::read_unaligned(self.base().add(offset) as *const FrameRecord) })
    }

    /// Slot index of the most recently written record, or `None` while the
    /// ring is empty.
    pub fn latest_frame_index(&self) -> Option<u64> {
        let h = self.header();
        if h.is_full {
            Some((h.head_idx + h.max_entries as u64 - 1) % h.max_entries as u64)
        } else if h.tail_idx == 0 {
            None
        } else {
            Some(h.tail_idx - 1)
        }
    }

    /// Steps `idx` one slot backward. Returns `None` once the decremented
    /// index reaches `head_idx` (the producer's write cursor) or the
    /// producer has marked the process dead.
    pub fn decrement_index(&self, idx: u64) -> Option<u64> {
        let h = self.header();
        if !h.process_active {
            return None;
        }
        let wrap_to = if h.is_full {
            h.max_entries as u64 - 1
        } else {
            h.tail_idx
        };
        let prev = if idx == 0 { wrap_to } else { idx - 1 };
        if prev == h.head_idx {
            None
        } else {
            Some(prev)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testkit::{displayed_record, RingWriter};

    #[test]
    fn latest_and_decrement_before_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 8, 1_000_000).unwrap();
        assert!(w.view().latest_frame_index().is_none());

        for i in 0..3u64 {
            w.push(&displayed_record(0x10, 1_000 * (i + 1), 100));
        }
        let view = w.view();
        assert_eq!(view.latest_frame_index(), Some(2));
        // 2 -> 1 -> stop: decrementing from 1 reaches head_idx (0).
        assert_eq!(view.decrement_index(2), Some(1));
        assert_eq!(view.decrement_index(1), None);
    }

    #[test]
    fn decrement_wraps_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 4, 1_000_000).unwrap();
        for i in 0..6u64 {
            w.push(&displayed_record(0x10, 1_000 * (i + 1), 100));
        }
        let view = w.view();
        let h = view.header();
        assert!(h.is_full);
        // Writes 4 and 5 overwrote slots 0 and 1; the write cursor sits at 2.
        assert_eq!(h.head_idx, 2);
        assert_eq!(view.latest_frame_index(), Some(1));
        assert_eq!(view.decrement_index(1), Some(0));
        assert_eq!(view.decrement_index(0), Some(3));
        assert_eq!(view.decrement_index(3), None);
    }

    #[test]
    fn decrement_stops_when_process_dead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 8, 1_000_000).unwrap();
        for i in 0..3u64 {
            w.push(&displayed_record(0x10, 1_000 * (i + 1), 100));
        }
        w.set_process_active(false);
        assert!(!w.view().header().process_active);
        assert_eq!(w.view().decrement_index(2), None);
    }
}
