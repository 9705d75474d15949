//! Fake-producer harness for tests.
//!
//! [`RingWriter`] plays the capture service: it creates a ring file,
//! appends records with the same head/tail/full bookkeeping the service
//! uses, and can flip `process_active` while a reader holds the mapping.
//! Not part of the supported API.
#![doc(hidden)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::record::{
    FinalState, FrameRecord, FrameType, RingHeader, HEADER_PROCESS_ACTIVE_OFFSET, RECORD_STRIDE,
    RING_HEADER_SIZE,
};
use crate::ring::RingView;

pub struct RingWriter {
    file: std::fs::File,
    path: PathBuf,
    max_entries: u32,
    qpc_frequency: u64,
    head_idx: u64,
    tail_idx: u64,
    is_full: bool,
    process_active: bool,
}

fn struct_bytes<T>(value: &T) -> &[u8] {
    // The record types carry explicit reserved fields in place of padding,
    // so every byte is initialized.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

impl RingWriter {
    pub fn create(path: &Path, max_entries: u32, qpc_frequency: u64) -> std::io::Result<RingWriter> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((RING_HEADER_SIZE + max_entries as usize * RECORD_STRIDE) as u64)?;
        let mut writer = RingWriter {
            file,
            path: path.to_path_buf(),
            max_entries,
            qpc_frequency,
            head_idx: 0,
            tail_idx: 0,
            is_full: false,
            process_active: true,
        };
        let header = RingHeader {
            start_qpc: 0,
            qpc_frequency,
            max_entries,
            _reserved: 0,
            head_idx: 0,
            tail_idx: 0,
            process_active: 1,
            is_full: 0,
        };
        writer.file.seek(SeekFrom::Start(0))?;
        writer.file.write_all(struct_bytes(&header))?;
        writer.file.flush()?;
        Ok(writer)
    }

    /// Appends one record, advancing the write bookkeeping the way the
    /// capture service does: `tail_idx` is the next write slot until the
    /// ring wraps, after which `head_idx` becomes the write cursor.
    pub fn push(&mut self, record: &FrameRecord) -> u64 {
        let slot = if self.is_full { self.head_idx } else { self.tail_idx };
        let offset = (RING_HEADER_SIZE + slot as usize * RECORD_STRIDE) as u64;
        self.file.seek(SeekFrom::Start(offset)).unwrap();
        self.file.write_all(struct_bytes(record)).unwrap();
        if self.is_full {
            self.head_idx = (self.head_idx + 1) % self.max_entries as u64;
        } else {
            self.tail_idx += 1;
            if self.tail_idx == self.max_entries as u64 {
                self.is_full = true;
                self.head_idx = 0;
                self.tail_idx = 0;
            }
        }
        self.write_header();
        slot
    }

    pub fn set_process_active(&mut self, active: bool) {
        self.process_active = active;
        self.file
            .seek(SeekFrom::Start(HEADER_PROCESS_ACTIVE_OFFSET as u64))
            .unwrap();
        self.file
            .write_all(&u32::from(active).to_ne_bytes())
            .unwrap();
        self.file.flush().unwrap();
    }

    fn write_header(&mut self) {
        let header = RingHeader {
            start_qpc: 0,
            qpc_frequency: self.qpc_frequency,
            max_entries: self.max_entries,
            _reserved: 0,
            head_idx: self.head_idx,
            tail_idx: self.tail_idx,
            process_active: u32::from(self.process_active),
            is_full: u32::from(self.is_full),
        };
        self.file.seek(SeekFrom::Start(0)).unwrap();
        self.file.write_all(struct_bytes(&header)).unwrap();
        self.file.flush().unwrap();
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn view(&self) -> RingView {
        RingView::open(&self.path).expect("ring file should map")
    }
}

/// A presented record with plausible timings derived from `present_start`.
pub fn displayed_record(swap_chain: u64, present_start: u64, time_in_present: u64) -> FrameRecord {
    let mut r = FrameRecord {
        present_start_time: present_start,
        present_stop_time: present_start + time_in_present,
        time_in_present,
        gpu_start_time: present_start + time_in_present,
        ready_time: present_start + time_in_present + 50,
        gpu_duration: 40,
        gpu_video_duration: 0,
        screen_time: present_start + time_in_present + 100,
        input_time: 0,
        swap_chain,
        frame_id: 0,
        frame_type: FrameType::Application as u32,
        final_state: FinalState::Presented as u32,
        present_mode: 3,
        runtime: 1,
        sync_interval: 1,
        present_flags: 0,
        supports_tearing: 0,
        ..FrameRecord::default()
    };
    r.set_application("app.exe");
    r
}

/// Like [`displayed_record`] but dropped: no screen time, discarded state.
pub fn dropped_record(swap_chain: u64, present_start: u64, time_in_present: u64) -> FrameRecord {
    let mut r = displayed_record(swap_chain, present_start, time_in_present);
    r.final_state = FinalState::Discarded as u32;
    r.screen_time = 0;
    r
}
