//! Per-tracked-process stream client.
//!
//! Owns the mapped ring view for one pid and a private monotonic cursor
//! used by the frame query: each consumed record comes with the companion
//! records the row gatherers need. A record is only handed out once its
//! next displayed present exists, so in-flight presents complete
//! retroactively on a later poll.

use std::path::Path;

use crate::error::{Error, Result};
use crate::record::FrameRecord;
use crate::ring::{HeaderSnapshot, RingView};

/// One consumed record plus the companions the gatherers read.
pub struct FrameSet {
    pub current: FrameRecord,
    pub next_displayed: FrameRecord,
    pub last_presented: Option<FrameRecord>,
    pub last_displayed: Option<FrameRecord>,
    pub prev_of_last_displayed: Option<FrameRecord>,
}

pub struct StreamClient {
    view: RingView,
    next_read_idx: Option<u64>,
}

fn in_range(h: &HeaderSnapshot, idx: u64) -> bool {
    if h.is_full {
        idx != h.head_idx && idx < h.max_entries as u64
    } else {
        idx < h.tail_idx
    }
}

fn next_index(h: &HeaderSnapshot, idx: u64) -> u64 {
    if h.is_full {
        (idx + 1) % h.max_entries as u64
    } else {
        idx + 1
    }
}

impl StreamClient {
    pub fn open(path: &Path) -> Result<StreamClient> {
        Ok(StreamClient {
            view: RingView::open(path)?,
            next_read_idx: None,
        })
    }

    pub fn view(&self) -> &RingView {
        &self.view
    }

    pub fn qpc_frequency(&self) -> u64 {
        self.view.header().qpc_frequency
    }

    pub fn latest_frame_index(&self) -> Option<u64> {
        self.view.latest_frame_index()
    }

    pub fn read_by_index(&self, idx: u64) -> Option<FrameRecord> {
        self.view.record(idx)
    }

    /// Yields the next unread record and its companions, or `Ok(None)` when
    /// the cursor has caught up or the newest records are still waiting for
    /// a displayed present.
    pub fn consume_next(&mut self) -> Result<Option<FrameSet>> {
        let h = self.view.header();
        if !h.process_active {
            return Err(Error::ProcessGone);
        }
        if self.view.latest_frame_index().is_none() {
            return Ok(None);
        }

        // The slot at head_idx belongs to the producer; the first readable
        // slot sits just past it.
        let cursor = *self
            .next_read_idx
            .get_or_insert_with(|| (h.head_idx + 1) % h.max_entries.max(1) as u64);
        if !in_range(&h, cursor) {
            return Ok(None);
        }
        let Some(current) = self.view.record(cursor) else {
            return Ok(None);
        };

        // Walk forward just far enough to find the next displayed present;
        // without one the record stays queued for a later poll.
        let mut next_displayed = None;
        let mut j = next_index(&h, cursor);
        while in_range(&h, j) {
            match self.view.record(j) {
                Some(r) if r.displayed() => {
                    next_displayed = Some(r);
                    break;
                }
                Some(_) => j = next_index(&h, j),
                None => break,
            }
        }
        let Some(next_displayed) = next_displayed else {
            return Ok(None);
        };

        // Backward companions: the immediately preceding present, the most
        // recent displayed present, and the displayed present before that.
        let mut last_presented = None;
        let mut last_displayed = None;
        let mut prev_of_last_displayed = None;
        let mut k = cursor;
        while let Some(prev) = self.view.decrement_index(k) {
            if !in_range(&h, prev) {
                break;
            }
            let Some(r) = self.view.record(prev) else {
                break;
            };
            if last_presented.is_none() {
                last_presented = Some(r);
            }
            if r.displayed() {
                if last_displayed.is_none() {
                    last_displayed = Some(r);
                } else {
                    prev_of_last_displayed = Some(r);
                    break;
                }
            }
            k = prev;
        }

        self.next_read_idx = Some(next_index(&h, cursor));
        Ok(Some(FrameSet {
            current,
            next_displayed,
            last_presented,
            last_displayed,
            prev_of_last_displayed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{displayed_record, dropped_record, RingWriter};

    #[test]
    fn consume_yields_records_in_order_with_companions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 16, 1_000_000).unwrap();
        for i in 0..5u64 {
            let mut r = displayed_record(0x10, 1_000 * (i + 1), 100);
            r.frame_id = i as u32 + 1;
            w.push(&r);
        }

        let mut client = StreamClient::open(&path).unwrap();
        // Slot 0 only ever serves as a companion; the first consumable
        // record is slot 1.
        let set = client.consume_next().unwrap().unwrap();
        assert_eq!(set.current.frame_id, 2);
        assert_eq!(set.last_presented.unwrap().frame_id, 1);
        assert_eq!(set.next_displayed.frame_id, 3);

        let set = client.consume_next().unwrap().unwrap();
        assert_eq!(set.current.frame_id, 3);
        assert_eq!(set.last_displayed.unwrap().frame_id, 2);
        assert_eq!(set.prev_of_last_displayed.unwrap().frame_id, 1);
    }

    #[test]
    fn record_waits_for_a_displayed_successor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 16, 1_000_000).unwrap();
        w.push(&displayed_record(0x10, 1_000, 100));
        w.push(&displayed_record(0x10, 2_000, 100));
        w.push(&dropped_record(0x10, 3_000, 100));

        let mut client = StreamClient::open(&path).unwrap();
        // Slot 1 has no displayed successor yet.
        assert!(client.consume_next().unwrap().is_none());

        w.push(&displayed_record(0x10, 4_000, 100));
        let set = client.consume_next().unwrap().unwrap();
        assert_eq!(set.current.present_start_time, 2_000);
        assert_eq!(set.next_displayed.present_start_time, 4_000);
    }

    #[test]
    fn dead_process_fails_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut w = RingWriter::create(&path, 16, 1_000_000).unwrap();
        w.push(&displayed_record(0x10, 1_000, 100));
        w.set_process_active(false);

        let mut client = StreamClient::open(&path).unwrap();
        assert!(matches!(client.consume_next(), Err(Error::ProcessGone)));
    }
}
