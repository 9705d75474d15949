//! Metric catalog: identifiers, statistics, and polled data types.
//!
//! This is the read-only dictionary that query registration consults to lay
//! out result blobs. Each metric has a fixed polled [`DataType`] and is
//! available on one or more query surfaces (dynamic, frame, static).

/// Every metric a query element can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    // Per-swap-chain scalars taken from the most recent present.
    Application,
    SwapChainAddress,
    PresentMode,
    PresentRuntime,
    PresentFlags,
    SyncInterval,
    AllowsTearing,
    FrameType,

    // Per-present frame metrics.
    CpuStartQpc,
    CpuStartTime,
    CpuBusy,
    CpuWait,
    CpuFrameTime,
    GpuLatency,
    GpuBusy,
    GpuWait,
    GpuTime,
    GpuVideoBusy,
    DisplayLatency,
    DisplayedTime,
    AnimationError,
    PresentedFps,
    ApplicationFps,
    DisplayedFps,
    DroppedFrames,
    ClickToPhotonLatency,

    // GPU telemetry channels.
    GpuPower,
    GpuVoltage,
    GpuFrequency,
    GpuTemperature,
    GpuUtilization,
    GpuRenderComputeUtilization,
    GpuMediaUtilization,
    GpuMemPower,
    GpuMemVoltage,
    GpuMemFrequency,
    GpuMemEffectiveFrequency,
    GpuMemTemperature,
    GpuMemUsed,
    GpuMemUtilization,
    GpuMemWriteBandwidth,
    GpuMemReadBandwidth,
    GpuFanSpeed,
    GpuPowerLimited,
    GpuTemperatureLimited,
    GpuCurrentLimited,
    GpuVoltageLimited,
    GpuUtilizationLimited,
    GpuMemPowerLimited,
    GpuMemTemperatureLimited,
    GpuMemCurrentLimited,
    GpuMemVoltageLimited,
    GpuMemUtilizationLimited,

    // CPU telemetry channels.
    CpuUtilization,
    CpuPower,
    CpuTemperature,
    CpuFrequency,

    // Static device metrics served from the cached device table.
    CpuName,
    CpuVendor,
    CpuPowerLimit,
    GpuName,
    GpuVendor,
    GpuMemSize,
    GpuMemMaxBandwidth,
    GpuSustainedPowerLimit,
}

/// Wire type of a polled metric value inside a result blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Double,
    Uint64,
    Uint32,
    Int32,
    Enum,
    Bool,
    String,
}

impl DataType {
    /// Number of bytes the value occupies in a blob.
    pub fn size(self) -> usize {
        match self {
            DataType::Double | DataType::Uint64 => 8,
            DataType::Uint32 | DataType::Int32 | DataType::Enum => 4,
            DataType::Bool => 1,
            DataType::String => crate::record::APPLICATION_NAME_CAP,
        }
    }
}

/// Statistic applied to a per-present or telemetry series.
///
/// `MidLerp`, `NewestPoint`, `OldestPoint` and `Count` are reserved: they
/// evaluate to zero until their behavior is settled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Avg,
    NonZeroAvg,
    Max,
    Min,
    MidPoint,
    Percentile(f64),
    MidLerp,
    NewestPoint,
    OldestPoint,
    Count,
}

impl Metric {
    /// Type of the value written to a blob when this metric is polled.
    pub fn polled_type(self) -> DataType {
        use Metric::*;
        match self {
            Application | CpuName | GpuName => DataType::String,
            SwapChainAddress | CpuStartQpc => DataType::Uint64,
            PresentMode | PresentRuntime | FrameType | CpuVendor | GpuVendor => DataType::Enum,
            PresentFlags => DataType::Uint32,
            SyncInterval => DataType::Int32,
            AllowsTearing => DataType::Bool,
            _ => DataType::Double,
        }
    }

    /// Whether this metric is served from the static device table.
    pub fn is_static(self) -> bool {
        use Metric::*;
        matches!(
            self,
            CpuName
                | CpuVendor
                | CpuPowerLimit
                | GpuName
                | GpuVendor
                | GpuMemSize
                | GpuMemMaxBandwidth
                | GpuSustainedPowerLimit
        )
    }

    /// Whether this metric contributes to the per-present frame buckets and
    /// therefore forces the dynamic poll to run the frame-metric engine.
    pub fn is_frame_bucket(self) -> bool {
        use Metric::*;
        matches!(
            self,
            Application
                | SwapChainAddress
                | PresentMode
                | PresentRuntime
                | PresentFlags
                | SyncInterval
                | AllowsTearing
                | FrameType
                | CpuStartQpc
                | CpuStartTime
                | CpuBusy
                | CpuWait
                | CpuFrameTime
                | GpuLatency
                | GpuBusy
                | GpuWait
                | GpuTime
                | GpuVideoBusy
                | DisplayLatency
                | DisplayedTime
                | AnimationError
                | PresentedFps
                | ApplicationFps
                | DisplayedFps
                | DroppedFrames
                | ClickToPhotonLatency
        )
    }

    /// Whether a frame query can gather this metric into a per-frame row.
    pub fn is_frame_gatherable(self) -> bool {
        use Metric::*;
        if self.is_static() {
            return false;
        }
        !matches!(self, PresentedFps | ApplicationFps | DisplayedFps | DroppedFrames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polled_sizes() {
        assert_eq!(Metric::GpuPower.polled_type().size(), 8);
        assert_eq!(Metric::Application.polled_type().size(), 260);
        assert_eq!(Metric::PresentMode.polled_type().size(), 4);
        assert_eq!(Metric::AllowsTearing.polled_type().size(), 1);
        assert_eq!(Metric::CpuStartQpc.polled_type().size(), 8);
    }

    #[test]
    fn surface_availability() {
        assert!(Metric::GpuName.is_static());
        assert!(!Metric::GpuName.is_frame_gatherable());
        assert!(Metric::CpuBusy.is_frame_bucket());
        assert!(Metric::CpuBusy.is_frame_gatherable());
        assert!(!Metric::PresentedFps.is_frame_gatherable());
        assert!(!Metric::GpuPower.is_frame_bucket());
        assert!(Metric::GpuPower.is_frame_gatherable());
    }
}
