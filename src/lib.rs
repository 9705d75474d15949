//! frametap is a graphics-frame telemetry middleware.
//!
//! A co-resident capture service writes one record per present event into a
//! shared-memory ring, each record carrying the latest GPU/CPU power
//! telemetry sample. This crate maps those rings read-only, reconstructs
//! per-frame CPU/GPU/display metrics from the raw present stream, and
//! serves two query surfaces into caller-owned blobs:
//!
//! - **dynamic queries** return statistics (average, percentile, min/max,
//!   ...) over a sliding window anchored a client-chosen offset behind now;
//! - **frame queries** return one row per present event.
//!
//! ```no_run
//! use frametap::{Metric, Middleware, QueryElement, Stat};
//!
//! # fn main() -> frametap::Result<()> {
//! let mut mw = Middleware::connect(std::path::Path::new("/run/frametap/control"))?;
//! mw.start_streaming(4242)?;
//!
//! let mut elements = vec![
//!     QueryElement::new(Metric::PresentedFps, Stat::Avg),
//!     QueryElement::new(Metric::GpuPower, Stat::Percentile(0.99)),
//! ];
//! let query = mw.register_dynamic_query(&mut elements, 2000.0, 0.0)?;
//! let blob_size = elements.last().map(|e| e.data_offset + e.data_size).unwrap();
//!
//! let mut blob = vec![0u8; blob_size];
//! let mut num_swap_chains = 1;
//! mw.poll_dynamic_query(query, 4242, &mut blob, &mut num_swap_chains)?;
//! # Ok(())
//! # }
//! ```
//!
//! `Middleware` operations are not internally synchronized; drive one
//! instance from one thread.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use fxhash::FxHasher;

pub(crate) type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

pub mod control;
mod error;
mod frame_metrics;
pub mod logging;
mod metric;
mod middleware;
mod query;
mod record;
mod ring;
mod stats;
mod stream;
mod telemetry;
#[doc(hidden)]
pub mod testkit;

pub use error::{Error, Result};
pub use frame_metrics::TraceTimebase;
pub use metric::{DataType, Metric, Stat};
pub use middleware::{CpuInfo, DeviceInfo, Middleware};
pub use query::{DynamicQueryHandle, FrameQueryHandle, QueryElement};
pub use record::{
    CpuTelemetry, FinalState, FrameRecord, FrameType, GraphicsRuntime, PowerTelemetry,
    PresentMode, RingHeader,
};
pub use ring::{HeaderSnapshot, RingView};
pub use stream::{FrameSet, StreamClient};
