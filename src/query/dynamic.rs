//! Dynamic (windowed-statistic) query compilation.

use log::warn;

use crate::error::{Error, Result};
use crate::query::{layout_elements, QueryElement};
use crate::telemetry::{cpu_bits_for_metric, gpu_bits_for_metric, CpuTelemetryBits, GpuTelemetryBits};

/// Engine-owned state of a registered dynamic query.
#[derive(Debug)]
pub(crate) struct DynamicQuery {
    pub elements: Vec<QueryElement>,
    pub window_size_ms: f64,
    pub metric_offset_ms: f64,
    pub accum_gpu_bits: GpuTelemetryBits,
    pub accum_cpu_bits: CpuTelemetryBits,
    pub accum_fps_data: bool,
    /// Index into the cached GPU table when the query pins a device.
    pub device_index: Option<usize>,
    /// Size of the cached result blob: end of the last element.
    pub blob_size: usize,
}

impl DynamicQuery {
    /// Lays out `elements` and derives the accumulation masks.
    ///
    /// `gpu_device_ids` lists the known graphics adapters; a query may pin
    /// at most one of them (device id 0 means "not an adapter").
    pub fn compile(
        elements: &mut [QueryElement],
        window_size_ms: f64,
        metric_offset_ms: f64,
        gpu_device_ids: &[u32],
    ) -> Result<DynamicQuery> {
        if elements.is_empty() {
            return Err(Error::Failure("dynamic query has no elements".into()));
        }

        let mut device_index = None;
        let mut accum_gpu_bits = GpuTelemetryBits::empty();
        let mut accum_cpu_bits = CpuTelemetryBits::empty();
        let mut accum_fps_data = false;

        for qe in elements.iter() {
            if qe.device_id != 0 {
                match device_index {
                    Some(idx) => {
                        let pinned = gpu_device_ids[idx];
                        if pinned != qe.device_id {
                            warn!(
                                "multiple GPU devices in one query ({pinned} and {})",
                                qe.device_id
                            );
                            return Err(Error::InvalidAdapterId);
                        }
                    }
                    None => match gpu_device_ids.iter().position(|id| *id == qe.device_id) {
                        Some(idx) => device_index = Some(idx),
                        None => {
                            warn!("unknown device id {} in dynamic query", qe.device_id)
                        }
                    },
                }
            }

            if qe.metric.is_frame_bucket() {
                accum_fps_data = true;
            } else if let Some(bits) = gpu_bits_for_metric(qe.metric, qe.array_index) {
                accum_gpu_bits |= bits;
            } else if let Some(bits) = cpu_bits_for_metric(qe.metric) {
                accum_cpu_bits |= bits;
            }
        }

        let blob_size = layout_elements(elements);
        Ok(DynamicQuery {
            elements: elements.to_vec(),
            window_size_ms,
            metric_offset_ms,
            accum_gpu_bits,
            accum_cpu_bits,
            accum_fps_data,
            device_index,
            blob_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Metric, Stat};

    #[test]
    fn layout_is_sequential_and_typed() {
        let mut elements = vec![
            QueryElement::new(Metric::GpuPower, Stat::Avg),
            QueryElement::new(Metric::Application, Stat::Avg),
            QueryElement::new(Metric::PresentedFps, Stat::Avg),
        ];
        let q = DynamicQuery::compile(&mut elements, 1000.0, 0.0, &[]).unwrap();
        assert_eq!(elements[0].data_offset, 0);
        assert_eq!(elements[0].data_size, 8);
        assert_eq!(elements[1].data_offset, 8);
        assert_eq!(elements[1].data_size, 260);
        assert_eq!(elements[2].data_offset, 268);
        assert_eq!(q.blob_size, 276);
        assert!(q.accum_fps_data);
        assert!(q.accum_gpu_bits.contains(crate::telemetry::GpuTelemetryBits::GPU_POWER));
    }

    #[test]
    fn telemetry_only_query_does_not_run_frame_buckets() {
        let mut elements = vec![
            QueryElement::new(Metric::GpuPower, Stat::Avg),
            QueryElement::new(Metric::CpuPower, Stat::Max),
        ];
        let q = DynamicQuery::compile(&mut elements, 1000.0, 0.0, &[]).unwrap();
        assert!(!q.accum_fps_data);
        assert!(q.accum_cpu_bits.contains(crate::telemetry::CpuTelemetryBits::CPU_POWER));
    }

    #[test]
    fn two_distinct_devices_are_rejected() {
        let mut elements = vec![
            QueryElement::new(Metric::GpuPower, Stat::Avg).with_device(7),
            QueryElement::new(Metric::GpuTemperature, Stat::Avg).with_device(8),
        ];
        let err = DynamicQuery::compile(&mut elements, 1000.0, 0.0, &[7, 8]).unwrap_err();
        assert!(matches!(err, Error::InvalidAdapterId));
    }

    #[test]
    fn unknown_device_is_tolerated() {
        let mut elements = vec![QueryElement::new(Metric::GpuPower, Stat::Avg).with_device(99)];
        let q = DynamicQuery::compile(&mut elements, 1000.0, 0.0, &[7]).unwrap();
        assert!(q.device_index.is_none());
    }
}
