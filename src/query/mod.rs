//! Query registration and handle types.
//!
//! Clients describe what they want as a list of [`QueryElement`]s;
//! registration lays the elements out in a contiguous result blob and
//! returns an engine-owned handle. Blob values are written in native
//! endianness at the offsets assigned during registration.

pub(crate) mod dynamic;
pub(crate) mod frame;

use crate::metric::{Metric, Stat};

/// One requested metric within a query.
///
/// `data_offset` and `data_size` are outputs: registration assigns each
/// element its slice of the result blob.
#[derive(Debug, Clone)]
pub struct QueryElement {
    pub metric: Metric,
    pub stat: Stat,
    pub device_id: u32,
    pub array_index: u32,
    pub data_offset: usize,
    pub data_size: usize,
}

impl QueryElement {
    pub fn new(metric: Metric, stat: Stat) -> QueryElement {
        QueryElement {
            metric,
            stat,
            device_id: 0,
            array_index: 0,
            data_offset: 0,
            data_size: 0,
        }
    }

    pub fn with_device(mut self, device_id: u32) -> QueryElement {
        self.device_id = device_id;
        self
    }

    pub fn with_array_index(mut self, array_index: u32) -> QueryElement {
        self.array_index = array_index;
        self
    }
}

/// Opaque handle to a registered dynamic query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicQueryHandle(pub(crate) u64);

/// Opaque handle to a registered frame-event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameQueryHandle(pub(crate) u64);

pub(crate) fn write_f64(out: &mut [u8], offset: usize, v: f64) {
    out[offset..offset + 8].copy_from_slice(&v.to_ne_bytes());
}

pub(crate) fn write_u64(out: &mut [u8], offset: usize, v: u64) {
    out[offset..offset + 8].copy_from_slice(&v.to_ne_bytes());
}

pub(crate) fn write_u32(out: &mut [u8], offset: usize, v: u32) {
    out[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
}

pub(crate) fn write_i32(out: &mut [u8], offset: usize, v: i32) {
    out[offset..offset + 4].copy_from_slice(&v.to_ne_bytes());
}

pub(crate) fn write_bool(out: &mut [u8], offset: usize, v: bool) {
    out[offset] = u8::from(v);
}

/// NUL-terminated string write, capped to the element's size.
pub(crate) fn write_string(out: &mut [u8], offset: usize, size: usize, bytes: &[u8]) {
    let n = bytes.len().min(size.saturating_sub(1));
    out[offset..offset + n].copy_from_slice(&bytes[..n]);
    out[offset + n..offset + size].fill(0);
}

/// Assigns sequential blob offsets from the metric catalog; returns the
/// total blob size.
pub(crate) fn layout_elements(elements: &mut [QueryElement]) -> usize {
    let mut offset = 0usize;
    for qe in elements.iter_mut() {
        qe.data_offset = offset;
        qe.data_size = qe.metric.polled_type().size();
        offset += qe.data_size;
    }
    offset
}
