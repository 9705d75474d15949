//! Frame-event query compilation and row gathering.
//!
//! Each element compiles into a gatherer: a pure function of the per-poll
//! [`FrameContext`] writing one value at a fixed offset of the row blob.

use crate::error::{Error, Result};
use crate::frame_metrics::TraceTimebase;
use crate::metric::Metric;
use crate::query::{
    layout_elements, write_bool, write_f64, write_i32, write_string, write_u32, write_u64,
    QueryElement,
};
use crate::record::FrameRecord;
use crate::telemetry::{cpu_sample_value, gpu_sample_value};

/// Everything a gatherer may read while emitting one row.
pub(crate) struct FrameContext<'a> {
    pub timebase: TraceTimebase,
    pub start_qpc: u64,
    pub current: &'a FrameRecord,
    pub next_displayed: &'a FrameRecord,
    pub last_presented: &'a FrameRecord,
    pub last_displayed: Option<&'a FrameRecord>,
    pub prev_of_last_displayed: Option<&'a FrameRecord>,
}

impl FrameContext<'_> {
    /// CPU start of the current frame: the instant the previous present
    /// call returned.
    fn cpu_start(&self) -> u64 {
        self.last_presented.present_start_time + self.last_presented.time_in_present
    }
}

#[derive(Debug, Clone)]
struct Gatherer {
    metric: Metric,
    array_index: u32,
    offset: usize,
    size: usize,
}

/// Engine-owned state of a registered frame-event query.
#[derive(Debug)]
pub(crate) struct FrameQuery {
    gatherers: Vec<Gatherer>,
    blob_size: usize,
    referenced_device: Option<u32>,
}

impl FrameQuery {
    pub fn compile(elements: &mut [QueryElement]) -> Result<FrameQuery> {
        if elements.is_empty() {
            return Err(Error::Failure("frame query has no elements".into()));
        }
        for qe in elements.iter() {
            if !qe.metric.is_frame_gatherable() {
                return Err(Error::Failure(format!(
                    "metric {:?} cannot be gathered per frame",
                    qe.metric
                )));
            }
        }
        let blob_size = layout_elements(elements);
        let referenced_device = elements.iter().map(|qe| qe.device_id).find(|id| *id != 0);
        let gatherers = elements
            .iter()
            .map(|qe| Gatherer {
                metric: qe.metric,
                array_index: qe.array_index,
                offset: qe.data_offset,
                size: qe.data_size,
            })
            .collect();
        Ok(FrameQuery {
            gatherers,
            blob_size,
            referenced_device,
        })
    }

    /// Row stride in the output blob.
    pub fn blob_size(&self) -> usize {
        self.blob_size
    }

    pub fn referenced_device(&self) -> Option<u32> {
        self.referenced_device
    }

    /// Runs every gatherer against `ctx`, writing one row into `out`.
    pub fn gather_row(&self, ctx: &FrameContext, out: &mut [u8]) {
        for g in &self.gatherers {
            g.gather(ctx, out);
        }
    }
}

impl Gatherer {
    fn gather(&self, ctx: &FrameContext, out: &mut [u8]) {
        let tb = &ctx.timebase;
        let cur = ctx.current;
        let cpu_start = ctx.cpu_start();
        let displayed = cur.displayed();

        match self.metric {
            Metric::Application => {
                write_string(out, self.offset, self.size, cur.application_bytes())
            }
            Metric::SwapChainAddress => write_u64(out, self.offset, cur.swap_chain),
            Metric::PresentMode => write_u32(out, self.offset, cur.present_mode),
            Metric::PresentRuntime => write_u32(out, self.offset, cur.runtime),
            Metric::PresentFlags => write_u32(out, self.offset, cur.present_flags),
            Metric::SyncInterval => write_i32(out, self.offset, cur.sync_interval),
            Metric::AllowsTearing => write_bool(out, self.offset, cur.supports_tearing != 0),
            Metric::FrameType => write_u32(out, self.offset, cur.frame_type),
            Metric::CpuStartQpc => write_u64(out, self.offset, cpu_start),
            Metric::CpuStartTime => write_f64(
                out,
                self.offset,
                tb.delta_ms(cpu_start.saturating_sub(ctx.start_qpc)),
            ),
            Metric::CpuBusy => write_f64(
                out,
                self.offset,
                tb.unsigned_delta_ms(cpu_start, cur.present_start_time),
            ),
            Metric::CpuWait => write_f64(out, self.offset, tb.delta_ms(cur.time_in_present)),
            Metric::CpuFrameTime => {
                let busy = tb.unsigned_delta_ms(cpu_start, cur.present_start_time);
                write_f64(out, self.offset, busy + tb.delta_ms(cur.time_in_present))
            }
            Metric::GpuLatency => write_f64(
                out,
                self.offset,
                tb.unsigned_delta_ms(cpu_start, cur.gpu_start_time),
            ),
            Metric::GpuBusy => write_f64(out, self.offset, tb.delta_ms(cur.gpu_duration)),
            Metric::GpuWait => {
                let duration = tb.unsigned_delta_ms(cur.gpu_start_time, cur.ready_time);
                let busy = tb.delta_ms(cur.gpu_duration);
                write_f64(out, self.offset, (duration - busy).max(0.0))
            }
            Metric::GpuTime => {
                let duration = tb.unsigned_delta_ms(cur.gpu_start_time, cur.ready_time);
                let busy = tb.delta_ms(cur.gpu_duration);
                write_f64(out, self.offset, busy + (duration - busy).max(0.0))
            }
            Metric::GpuVideoBusy => {
                write_f64(out, self.offset, tb.delta_ms(cur.gpu_video_duration))
            }
            Metric::DisplayLatency => {
                let v = if displayed {
                    tb.unsigned_delta_ms(cpu_start, cur.screen_time)
                } else {
                    0.0
                };
                write_f64(out, self.offset, v)
            }
            Metric::DisplayedTime => {
                let v = if displayed {
                    tb.unsigned_delta_ms(cur.screen_time, ctx.next_displayed.screen_time)
                } else {
                    0.0
                };
                write_f64(out, self.offset, v)
            }
            Metric::AnimationError => {
                let v = match (displayed, ctx.last_displayed, ctx.prev_of_last_displayed) {
                    (true, Some(ld), Some(pold)) => {
                        let ld_cpu_start = pold.present_start_time + pold.time_in_present;
                        let screen_delta = cur.screen_time as i64 - ld.screen_time as i64;
                        let cpu_delta = cpu_start as i64 - ld_cpu_start as i64;
                        tb.signed_ticks_ms(screen_delta - cpu_delta)
                    }
                    _ => 0.0,
                };
                write_f64(out, self.offset, v)
            }
            Metric::ClickToPhotonLatency => {
                let v = if displayed && cur.input_time != 0 {
                    tb.unsigned_delta_ms(cur.input_time, cur.screen_time)
                } else {
                    0.0
                };
                write_f64(out, self.offset, v)
            }
            metric => {
                if let Some(v) = gpu_sample_value(&cur.power, metric, self.array_index) {
                    write_f64(out, self.offset, v);
                } else if let Some(v) = cpu_sample_value(&cur.cpu, metric) {
                    write_f64(out, self.offset, v);
                }
            }
        }
    }
}
