//! POD layout shared with the capture service.
//!
//! The service maps a named region and appends one [`FrameRecord`] per
//! present event, each carrying the most recent GPU and CPU telemetry
//! samples alongside the present timestamps. All timestamps are QPC ticks
//! in the producer's timebase; `qpc_frequency` in the ring header gives
//! ticks per second.

/// Fixed-size header at offset 0 of the shared-memory region.
///
/// `head_idx` is the producer's write cursor; the slot it points at must
/// never be read. `tail_idx` is the next write position before the ring has
/// wrapped. `process_active` and `is_full` are nonzero flags.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RingHeader {
    pub start_qpc: u64,
    pub qpc_frequency: u64,
    pub max_entries: u32,
    pub _reserved: u32,
    pub head_idx: u64,
    pub tail_idx: u64,
    pub process_active: u32,
    pub is_full: u32,
}

pub const RING_HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();
pub const RECORD_STRIDE: usize = std::mem::size_of::<FrameRecord>();

/// Byte offsets of the header fields published by the producer after each
/// write. The ring view loads these with acquire ordering.
pub(crate) const HEADER_HEAD_IDX_OFFSET: usize = 24;
pub(crate) const HEADER_TAIL_IDX_OFFSET: usize = 32;
pub(crate) const HEADER_PROCESS_ACTIVE_OFFSET: usize = 40;
pub(crate) const HEADER_IS_FULL_OFFSET: usize = 44;

/// How the present was classified by the capture service.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    NotSet = 0,
    Application = 1,
    Repeated = 2,
    Interpolated = 3,
}

impl FrameType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => FrameType::Application,
            2 => FrameType::Repeated,
            3 => FrameType::Interpolated,
            _ => FrameType::NotSet,
        }
    }
}

/// Terminal state of a present.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Unknown = 0,
    Presented = 1,
    Discarded = 2,
}

impl FinalState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => FinalState::Presented,
            2 => FinalState::Discarded,
            _ => FinalState::Unknown,
        }
    }
}

/// OS presentation path used for the present.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Unknown = 0,
    HardwareLegacyFlip = 1,
    HardwareLegacyCopyToFrontBuffer = 2,
    HardwareIndependentFlip = 3,
    ComposedFlip = 4,
    HardwareComposedIndependentFlip = 5,
    ComposedCopyWithGpuGdi = 6,
    ComposedCopyWithCpuGdi = 7,
}

impl PresentMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PresentMode::HardwareLegacyFlip,
            2 => PresentMode::HardwareLegacyCopyToFrontBuffer,
            3 => PresentMode::HardwareIndependentFlip,
            4 => PresentMode::ComposedFlip,
            5 => PresentMode::HardwareComposedIndependentFlip,
            6 => PresentMode::ComposedCopyWithGpuGdi,
            7 => PresentMode::ComposedCopyWithCpuGdi,
            _ => PresentMode::Unknown,
        }
    }
}

/// Graphics runtime the application presented through.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsRuntime {
    Unknown = 0,
    Dxgi = 1,
    D3d9 = 2,
}

impl GraphicsRuntime {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => GraphicsRuntime::Dxgi,
            2 => GraphicsRuntime::D3d9,
            _ => GraphicsRuntime::Unknown,
        }
    }
}

/// GPU power telemetry sample embedded in each record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerTelemetry {
    pub gpu_power_w: f64,
    pub gpu_voltage_v: f64,
    pub gpu_frequency_mhz: f64,
    pub gpu_temperature_c: f64,
    pub gpu_utilization: f64,
    pub gpu_render_compute_utilization: f64,
    pub gpu_media_utilization: f64,
    pub vram_power_w: f64,
    pub vram_voltage_v: f64,
    pub vram_frequency_mhz: f64,
    pub vram_effective_frequency_gbps: f64,
    pub vram_temperature_c: f64,
    pub fan_speed_rpm: [f64; 5],
    pub gpu_mem_total_size_b: u64,
    pub gpu_mem_used_b: u64,
    pub gpu_mem_write_bandwidth_bps: f64,
    pub gpu_mem_read_bandwidth_bps: f64,
    pub gpu_power_limited: u32,
    pub gpu_temperature_limited: u32,
    pub gpu_current_limited: u32,
    pub gpu_voltage_limited: u32,
    pub gpu_utilization_limited: u32,
    pub vram_power_limited: u32,
    pub vram_temperature_limited: u32,
    pub vram_current_limited: u32,
    pub vram_voltage_limited: u32,
    pub vram_utilization_limited: u32,
}

/// CPU telemetry sample embedded in each record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTelemetry {
    pub cpu_utilization: f64,
    pub cpu_power_w: f64,
    pub cpu_temperature_c: f64,
    pub cpu_frequency_mhz: f64,
}

pub const APPLICATION_NAME_CAP: usize = 260;

/// One present event as written by the capture service.
///
/// `present_stop_time` is always `present_start_time + time_in_present`.
/// `screen_time` is zero until the present reaches the screen; `input_time`
/// is zero when no input was attributed to the frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub present_start_time: u64,
    pub present_stop_time: u64,
    pub time_in_present: u64,
    pub gpu_start_time: u64,
    pub ready_time: u64,
    pub gpu_duration: u64,
    pub gpu_video_duration: u64,
    pub screen_time: u64,
    pub input_time: u64,
    pub swap_chain: u64,
    pub frame_id: u32,
    pub frame_type: u32,
    pub final_state: u32,
    pub present_mode: u32,
    pub runtime: u32,
    pub sync_interval: i32,
    pub present_flags: u32,
    pub supports_tearing: u32,
    pub application: [u8; APPLICATION_NAME_CAP],
    pub _reserved: u32,
    pub power: PowerTelemetry,
    pub cpu: CpuTelemetry,
}

impl Default for FrameRecord {
    fn default() -> Self {
        FrameRecord {
            present_start_time: 0,
            present_stop_time: 0,
            time_in_present: 0,
            gpu_start_time: 0,
            ready_time: 0,
            gpu_duration: 0,
            gpu_video_duration: 0,
            screen_time: 0,
            input_time: 0,
            swap_chain: 0,
            frame_id: 0,
            frame_type: 0,
            final_state: 0,
            present_mode: 0,
            runtime: 0,
            sync_interval: 0,
            present_flags: 0,
            supports_tearing: 0,
            application: [0; APPLICATION_NAME_CAP],
            _reserved: 0,
            power: PowerTelemetry::default(),
            cpu: CpuTelemetry::default(),
        }
    }
}

impl FrameRecord {
    pub fn frame_type(&self) -> FrameType {
        FrameType::from_raw(self.frame_type)
    }

    pub fn final_state(&self) -> FinalState {
        FinalState::from_raw(self.final_state)
    }

    pub fn present_mode(&self) -> PresentMode {
        PresentMode::from_raw(self.present_mode)
    }

    pub fn graphics_runtime(&self) -> GraphicsRuntime {
        GraphicsRuntime::from_raw(self.runtime)
    }

    pub fn displayed(&self) -> bool {
        self.final_state() == FinalState::Presented
    }

    /// The NUL-terminated application name bytes, without the terminator.
    pub fn application_bytes(&self) -> &[u8] {
        let end = self
            .application
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(APPLICATION_NAME_CAP);
        &self.application[..end]
    }

    pub fn set_application(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(APPLICATION_NAME_CAP - 1);
        self.application[..n].copy_from_slice(&bytes[..n]);
        self.application[n..].fill(0);
    }
}
