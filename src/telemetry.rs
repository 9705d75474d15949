//! Telemetry accumulation: scatters the GPU/CPU samples embedded in each
//! polled record into per-metric series.

use bitflags::bitflags;

use crate::metric::Metric;
use crate::record::{CpuTelemetry, PowerTelemetry};
use crate::FastHashMap;

bitflags! {
    /// GPU telemetry channels a query needs gathered.
    ///
    /// Bit positions mirror the capture service's capability mask; the
    /// timestamp channel is a valid capability but produces no metric.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GpuTelemetryBits: u64 {
        const TIME_STAMP = 1 << 0;
        const GPU_POWER = 1 << 1;
        const GPU_VOLTAGE = 1 << 2;
        const GPU_FREQUENCY = 1 << 3;
        const GPU_TEMPERATURE = 1 << 4;
        const GPU_UTILIZATION = 1 << 5;
        const GPU_RENDER_COMPUTE_UTILIZATION = 1 << 6;
        const GPU_MEDIA_UTILIZATION = 1 << 7;
        const VRAM_POWER = 1 << 8;
        const VRAM_VOLTAGE = 1 << 9;
        const VRAM_FREQUENCY = 1 << 10;
        const VRAM_EFFECTIVE_FREQUENCY = 1 << 11;
        const VRAM_TEMPERATURE = 1 << 12;
        const FAN_SPEED_0 = 1 << 13;
        const FAN_SPEED_1 = 1 << 14;
        const FAN_SPEED_2 = 1 << 15;
        const FAN_SPEED_3 = 1 << 16;
        const FAN_SPEED_4 = 1 << 17;
        const GPU_MEM_SIZE = 1 << 18;
        const GPU_MEM_USED = 1 << 19;
        const GPU_MEM_WRITE_BANDWIDTH = 1 << 20;
        const GPU_MEM_READ_BANDWIDTH = 1 << 21;
        const GPU_POWER_LIMITED = 1 << 22;
        const GPU_TEMPERATURE_LIMITED = 1 << 23;
        const GPU_CURRENT_LIMITED = 1 << 24;
        const GPU_VOLTAGE_LIMITED = 1 << 25;
        const GPU_UTILIZATION_LIMITED = 1 << 26;
        const VRAM_POWER_LIMITED = 1 << 27;
        const VRAM_TEMPERATURE_LIMITED = 1 << 28;
        const VRAM_CURRENT_LIMITED = 1 << 29;
        const VRAM_VOLTAGE_LIMITED = 1 << 30;
        const VRAM_UTILIZATION_LIMITED = 1 << 31;
    }
}

bitflags! {
    /// CPU telemetry channels a query needs gathered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuTelemetryBits: u16 {
        const CPU_UTILIZATION = 1 << 0;
        const CPU_POWER = 1 << 1;
        const CPU_TEMPERATURE = 1 << 2;
        const CPU_FREQUENCY = 1 << 3;
    }
}

/// Per-metric series keyed by array index (fan index for fan speeds,
/// otherwise 0).
#[derive(Debug, Default)]
pub struct MetricInfo {
    pub data: FastHashMap<u32, Vec<f64>>,
}

pub type MetricArrays = FastHashMap<Metric, MetricInfo>;

fn push(arrays: &mut MetricArrays, metric: Metric, array_index: u32, value: f64) {
    arrays
        .entry(metric)
        .or_default()
        .data
        .entry(array_index)
        .or_default()
        .push(value);
}

/// Scatters one GPU sample into the requested channels.
pub fn accumulate_gpu(bits: GpuTelemetryBits, p: &PowerTelemetry, arrays: &mut MetricArrays) {
    use GpuTelemetryBits as B;
    if bits.contains(B::GPU_POWER) {
        push(arrays, Metric::GpuPower, 0, p.gpu_power_w);
    }
    if bits.contains(B::GPU_VOLTAGE) {
        push(arrays, Metric::GpuVoltage, 0, p.gpu_voltage_v);
    }
    if bits.contains(B::GPU_FREQUENCY) {
        push(arrays, Metric::GpuFrequency, 0, p.gpu_frequency_mhz);
    }
    if bits.contains(B::GPU_TEMPERATURE) {
        push(arrays, Metric::GpuTemperature, 0, p.gpu_temperature_c);
    }
    if bits.contains(B::GPU_UTILIZATION) {
        push(arrays, Metric::GpuUtilization, 0, p.gpu_utilization);
    }
    if bits.contains(B::GPU_RENDER_COMPUTE_UTILIZATION) {
        push(
            arrays,
            Metric::GpuRenderComputeUtilization,
            0,
            p.gpu_render_compute_utilization,
        );
    }
    if bits.contains(B::GPU_MEDIA_UTILIZATION) {
        push(arrays, Metric::GpuMediaUtilization, 0, p.gpu_media_utilization);
    }
    if bits.contains(B::VRAM_POWER) {
        push(arrays, Metric::GpuMemPower, 0, p.vram_power_w);
    }
    if bits.contains(B::VRAM_VOLTAGE) {
        push(arrays, Metric::GpuMemVoltage, 0, p.vram_voltage_v);
    }
    if bits.contains(B::VRAM_FREQUENCY) {
        push(arrays, Metric::GpuMemFrequency, 0, p.vram_frequency_mhz);
    }
    if bits.contains(B::VRAM_EFFECTIVE_FREQUENCY) {
        push(
            arrays,
            Metric::GpuMemEffectiveFrequency,
            0,
            p.vram_effective_frequency_gbps,
        );
    }
    if bits.contains(B::VRAM_TEMPERATURE) {
        push(arrays, Metric::GpuMemTemperature, 0, p.vram_temperature_c);
    }
    for fan in 0..5u32 {
        let flag = B::from_bits_truncate(B::FAN_SPEED_0.bits() << fan);
        if bits.contains(flag) {
            push(arrays, Metric::GpuFanSpeed, fan, p.fan_speed_rpm[fan as usize]);
        }
    }
    if bits.contains(B::GPU_MEM_USED) {
        push(arrays, Metric::GpuMemUsed, 0, p.gpu_mem_used_b as f64);
    }
    if bits.contains(B::GPU_MEM_WRITE_BANDWIDTH) {
        push(
            arrays,
            Metric::GpuMemWriteBandwidth,
            0,
            p.gpu_mem_write_bandwidth_bps,
        );
    }
    if bits.contains(B::GPU_MEM_READ_BANDWIDTH) {
        push(
            arrays,
            Metric::GpuMemReadBandwidth,
            0,
            p.gpu_mem_read_bandwidth_bps,
        );
    }
    if bits.contains(B::GPU_POWER_LIMITED) {
        push(arrays, Metric::GpuPowerLimited, 0, f64::from(p.gpu_power_limited));
    }
    if bits.contains(B::GPU_TEMPERATURE_LIMITED) {
        push(
            arrays,
            Metric::GpuTemperatureLimited,
            0,
            f64::from(p.gpu_temperature_limited),
        );
    }
    if bits.contains(B::GPU_CURRENT_LIMITED) {
        push(arrays, Metric::GpuCurrentLimited, 0, f64::from(p.gpu_current_limited));
    }
    if bits.contains(B::GPU_VOLTAGE_LIMITED) {
        push(arrays, Metric::GpuVoltageLimited, 0, f64::from(p.gpu_voltage_limited));
    }
    if bits.contains(B::GPU_UTILIZATION_LIMITED) {
        push(
            arrays,
            Metric::GpuUtilizationLimited,
            0,
            f64::from(p.gpu_utilization_limited),
        );
    }
    if bits.contains(B::VRAM_POWER_LIMITED) {
        push(arrays, Metric::GpuMemPowerLimited, 0, f64::from(p.vram_power_limited));
    }
    if bits.contains(B::VRAM_TEMPERATURE_LIMITED) {
        push(
            arrays,
            Metric::GpuMemTemperatureLimited,
            0,
            f64::from(p.vram_temperature_limited),
        );
    }
    if bits.contains(B::VRAM_CURRENT_LIMITED) {
        push(
            arrays,
            Metric::GpuMemCurrentLimited,
            0,
            f64::from(p.vram_current_limited),
        );
    }
    if bits.contains(B::VRAM_VOLTAGE_LIMITED) {
        push(
            arrays,
            Metric::GpuMemVoltageLimited,
            0,
            f64::from(p.vram_voltage_limited),
        );
    }
    if bits.contains(B::VRAM_UTILIZATION_LIMITED) {
        push(
            arrays,
            Metric::GpuMemUtilizationLimited,
            0,
            f64::from(p.vram_utilization_limited),
        );
    }
}

/// Scatters one CPU sample into the requested channels.
pub fn accumulate_cpu(bits: CpuTelemetryBits, c: &CpuTelemetry, arrays: &mut MetricArrays) {
    use CpuTelemetryBits as B;
    if bits.contains(B::CPU_UTILIZATION) {
        push(arrays, Metric::CpuUtilization, 0, c.cpu_utilization);
    }
    if bits.contains(B::CPU_POWER) {
        push(arrays, Metric::CpuPower, 0, c.cpu_power_w);
    }
    if bits.contains(B::CPU_TEMPERATURE) {
        push(arrays, Metric::CpuTemperature, 0, c.cpu_temperature_c);
    }
    if bits.contains(B::CPU_FREQUENCY) {
        push(arrays, Metric::CpuFrequency, 0, c.cpu_frequency_mhz);
    }
}

/// Telemetry channel mask needed to gather `metric`; `array_index` selects
/// the fan for fan speed. `None` for non-GPU-telemetry metrics.
pub fn gpu_bits_for_metric(metric: Metric, array_index: u32) -> Option<GpuTelemetryBits> {
    use GpuTelemetryBits as B;
    let bits = match metric {
        Metric::GpuPower => B::GPU_POWER,
        Metric::GpuVoltage => B::GPU_VOLTAGE,
        Metric::GpuFrequency => B::GPU_FREQUENCY,
        Metric::GpuTemperature => B::GPU_TEMPERATURE,
        Metric::GpuUtilization => B::GPU_UTILIZATION,
        Metric::GpuRenderComputeUtilization => B::GPU_RENDER_COMPUTE_UTILIZATION,
        Metric::GpuMediaUtilization => B::GPU_MEDIA_UTILIZATION,
        Metric::GpuMemPower => B::VRAM_POWER,
        Metric::GpuMemVoltage => B::VRAM_VOLTAGE,
        Metric::GpuMemFrequency => B::VRAM_FREQUENCY,
        Metric::GpuMemEffectiveFrequency => B::VRAM_EFFECTIVE_FREQUENCY,
        Metric::GpuMemTemperature => B::VRAM_TEMPERATURE,
        Metric::GpuMemUsed => B::GPU_MEM_USED,
        // Derived from the memory-used series and the static memory size.
        Metric::GpuMemUtilization => B::GPU_MEM_USED.union(B::GPU_MEM_SIZE),
        Metric::GpuMemWriteBandwidth => B::GPU_MEM_WRITE_BANDWIDTH,
        Metric::GpuMemReadBandwidth => B::GPU_MEM_READ_BANDWIDTH,
        Metric::GpuFanSpeed => {
            B::from_bits_truncate(B::FAN_SPEED_0.bits() << array_index.min(4))
        }
        Metric::GpuPowerLimited => B::GPU_POWER_LIMITED,
        Metric::GpuTemperatureLimited => B::GPU_TEMPERATURE_LIMITED,
        Metric::GpuCurrentLimited => B::GPU_CURRENT_LIMITED,
        Metric::GpuVoltageLimited => B::GPU_VOLTAGE_LIMITED,
        Metric::GpuUtilizationLimited => B::GPU_UTILIZATION_LIMITED,
        Metric::GpuMemPowerLimited => B::VRAM_POWER_LIMITED,
        Metric::GpuMemTemperatureLimited => B::VRAM_TEMPERATURE_LIMITED,
        Metric::GpuMemCurrentLimited => B::VRAM_CURRENT_LIMITED,
        Metric::GpuMemVoltageLimited => B::VRAM_VOLTAGE_LIMITED,
        Metric::GpuMemUtilizationLimited => B::VRAM_UTILIZATION_LIMITED,
        _ => return None,
    };
    Some(bits)
}

pub fn cpu_bits_for_metric(metric: Metric) -> Option<CpuTelemetryBits> {
    use CpuTelemetryBits as B;
    let bits = match metric {
        Metric::CpuUtilization => B::CPU_UTILIZATION,
        Metric::CpuPower => B::CPU_POWER,
        Metric::CpuTemperature => B::CPU_TEMPERATURE,
        Metric::CpuFrequency => B::CPU_FREQUENCY,
        _ => return None,
    };
    Some(bits)
}

/// Reads one GPU telemetry field out of a sample, for frame-query rows.
pub fn gpu_sample_value(p: &PowerTelemetry, metric: Metric, array_index: u32) -> Option<f64> {
    let v = match metric {
        Metric::GpuPower => p.gpu_power_w,
        Metric::GpuVoltage => p.gpu_voltage_v,
        Metric::GpuFrequency => p.gpu_frequency_mhz,
        Metric::GpuTemperature => p.gpu_temperature_c,
        Metric::GpuUtilization => p.gpu_utilization,
        Metric::GpuRenderComputeUtilization => p.gpu_render_compute_utilization,
        Metric::GpuMediaUtilization => p.gpu_media_utilization,
        Metric::GpuMemPower => p.vram_power_w,
        Metric::GpuMemVoltage => p.vram_voltage_v,
        Metric::GpuMemFrequency => p.vram_frequency_mhz,
        Metric::GpuMemEffectiveFrequency => p.vram_effective_frequency_gbps,
        Metric::GpuMemTemperature => p.vram_temperature_c,
        Metric::GpuMemUsed => p.gpu_mem_used_b as f64,
        Metric::GpuMemWriteBandwidth => p.gpu_mem_write_bandwidth_bps,
        Metric::GpuMemReadBandwidth => p.gpu_mem_read_bandwidth_bps,
        Metric::GpuFanSpeed => p.fan_speed_rpm[array_index.min(4) as usize],
        Metric::GpuPowerLimited => f64::from(p.gpu_power_limited),
        Metric::GpuTemperatureLimited => f64::from(p.gpu_temperature_limited),
        Metric::GpuCurrentLimited => f64::from(p.gpu_current_limited),
        Metric::GpuVoltageLimited => f64::from(p.gpu_voltage_limited),
        Metric::GpuUtilizationLimited => f64::from(p.gpu_utilization_limited),
        Metric::GpuMemPowerLimited => f64::from(p.vram_power_limited),
        Metric::GpuMemTemperatureLimited => f64::from(p.vram_temperature_limited),
        Metric::GpuMemCurrentLimited => f64::from(p.vram_current_limited),
        Metric::GpuMemVoltageLimited => f64::from(p.vram_voltage_limited),
        Metric::GpuMemUtilizationLimited => f64::from(p.vram_utilization_limited),
        _ => return None,
    };
    Some(v)
}

/// Reads one CPU telemetry field out of a sample, for frame-query rows.
pub fn cpu_sample_value(c: &CpuTelemetry, metric: Metric) -> Option<f64> {
    let v = match metric {
        Metric::CpuUtilization => c.cpu_utilization,
        Metric::CpuPower => c.cpu_power_w,
        Metric::CpuTemperature => c.cpu_temperature_c,
        Metric::CpuFrequency => c.cpu_frequency_mhz,
        _ => return None,
    };
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_speed_bits_map_to_array_indices() {
        let mut p = PowerTelemetry::default();
        p.fan_speed_rpm = [100.0, 200.0, 300.0, 400.0, 500.0];
        let mut arrays = MetricArrays::default();
        let bits = GpuTelemetryBits::FAN_SPEED_1 | GpuTelemetryBits::FAN_SPEED_4;
        accumulate_gpu(bits, &p, &mut arrays);
        let info = &arrays[&Metric::GpuFanSpeed];
        assert_eq!(info.data[&1], vec![200.0]);
        assert_eq!(info.data[&4], vec![500.0]);
        assert!(!info.data.contains_key(&0));
    }

    #[test]
    fn unselected_channels_are_not_gathered() {
        let mut p = PowerTelemetry::default();
        p.gpu_power_w = 42.0;
        p.gpu_voltage_v = 0.9;
        let mut arrays = MetricArrays::default();
        accumulate_gpu(GpuTelemetryBits::GPU_POWER, &p, &mut arrays);
        assert_eq!(arrays[&Metric::GpuPower].data[&0], vec![42.0]);
        assert!(!arrays.contains_key(&Metric::GpuVoltage));
    }

    #[test]
    fn mem_utilization_requires_both_used_and_size_channels() {
        let bits = gpu_bits_for_metric(Metric::GpuMemUtilization, 0).unwrap();
        assert!(bits.contains(GpuTelemetryBits::GPU_MEM_USED));
        assert!(bits.contains(GpuTelemetryBits::GPU_MEM_SIZE));
    }
}
