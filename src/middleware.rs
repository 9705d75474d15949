//! The middleware proper: owns the control channel, the per-pid stream
//! clients, the cached device tables, and every registered query.
//!
//! All operations are driven by a single client thread; nothing here is
//! internally synchronized. Per-poll state (swap-chain map, telemetry
//! arrays) is function-local and rebuilt on every poll.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};

use crate::control::{
    AdapterInfo, ControlChannel, ControlTransport, DeviceVendor, Request, Response,
};
use crate::error::{Error, Result};
use crate::frame_metrics::{SwapChainState, TraceTimebase};
use crate::metric::{Metric, Stat};
use crate::query::dynamic::DynamicQuery;
use crate::query::frame::{FrameContext, FrameQuery};
use crate::query::{
    write_bool, write_f64, write_i32, write_string, write_u32, write_u64, DynamicQueryHandle,
    FrameQueryHandle, QueryElement,
};
use crate::record::FrameRecord;
use crate::stats::evaluate;
use crate::stream::StreamClient;
use crate::telemetry::{accumulate_cpu, accumulate_gpu, MetricArrays};
use crate::FastHashMap;

/// Clock drift beyond this many QPC ticks rebinds the query/frame delta.
const CLIENT_FRAME_DELTA_THRESHOLD: u64 = 50_000_000;

/// One graphics adapter from the cached device table.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub vendor: DeviceVendor,
    pub name: String,
    pub device_id: u32,
    pub adapter_index: u32,
    pub gpu_sustained_power_limit: Option<f64>,
    pub gpu_memory_size: Option<u64>,
    pub gpu_memory_max_bandwidth: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub vendor: DeviceVendor,
    pub name: String,
    pub power_limit: Option<f64>,
}

type QpcClock = Box<dyn Fn(u64) -> u64 + Send>;

fn monotonic_clock() -> QpcClock {
    let epoch = Instant::now();
    Box::new(move |frequency| {
        let ns = epoch.elapsed().as_nanos();
        (ns * frequency as u128 / 1_000_000_000) as u64
    })
}

fn ms_to_qpc(ms: f64, frequency: u64) -> u64 {
    (ms * frequency as f64 / 1000.0) as u64
}

pub struct Middleware {
    control: ControlChannel,
    client_pid: u32,
    stream_clients: FastHashMap<u32, StreamClient>,
    gpus: Vec<DeviceInfo>,
    cpu: Option<CpuInfo>,
    current_gpu_index: Option<usize>,
    active_device: Option<u32>,
    dynamic_queries: FastHashMap<u64, Arc<DynamicQuery>>,
    frame_queries: FastHashMap<u64, Arc<FrameQuery>>,
    next_query_id: u64,
    query_caches: FastHashMap<(u64, u32), Vec<u8>>,
    query_deltas: FastHashMap<(u64, u32), u64>,
    clock: QpcClock,
}

impl Middleware {
    /// Connects to the capture service's control socket and performs the
    /// device enumeration handshake.
    #[cfg(unix)]
    pub fn connect(control_path: &Path) -> Result<Middleware> {
        let control = ControlChannel::connect(control_path)?;
        Middleware::with_channel(control)
    }

    /// Builds a middleware over an already-connected transport.
    pub fn over_transport(transport: Box<dyn ControlTransport>) -> Result<Middleware> {
        Middleware::with_channel(ControlChannel::over(transport))
    }

    fn with_channel(mut control: ControlChannel) -> Result<Middleware> {
        let adapters = enumerate_adapters(&mut control)?;
        let gpus = adapters
            .into_iter()
            .enumerate()
            .map(|(i, a)| DeviceInfo {
                vendor: a.vendor,
                name: a.name,
                device_id: a.id,
                adapter_index: i as u32,
                gpu_sustained_power_limit: (a.gpu_sustained_power_limit != 0.0)
                    .then_some(a.gpu_sustained_power_limit),
                gpu_memory_size: (a.gpu_memory_size != 0).then_some(a.gpu_memory_size),
                gpu_memory_max_bandwidth: (a.gpu_memory_max_bandwidth != 0)
                    .then_some(a.gpu_memory_max_bandwidth),
            })
            .collect();

        // CPU metrics are best-effort; the service may not expose them.
        let cpu = match control.call(&Request::GetStaticCpuMetrics) {
            Ok(Response::StaticCpuMetrics {
                status,
                cpu_name,
                cpu_power_limit,
            }) if status.into_result().is_ok() => Some(CpuInfo {
                vendor: infer_cpu_vendor(&cpu_name),
                name: cpu_name,
                power_limit: (cpu_power_limit != 0.0).then_some(cpu_power_limit),
            }),
            _ => None,
        };

        Ok(Middleware {
            control,
            client_pid: std::process::id(),
            stream_clients: FastHashMap::default(),
            gpus,
            cpu,
            current_gpu_index: None,
            active_device: None,
            dynamic_queries: FastHashMap::default(),
            frame_queries: FastHashMap::default(),
            next_query_id: 1,
            query_caches: FastHashMap::default(),
            query_deltas: FastHashMap::default(),
            clock: monotonic_clock(),
        })
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.gpus
    }

    pub fn cpu_info(&self) -> Option<&CpuInfo> {
        self.cpu.as_ref()
    }

    /// Begins tracking `pid`: the service replies with the ring path for the
    /// process, which we map read-only.
    pub fn start_streaming(&mut self, pid: u32) -> Result<()> {
        let response = self.control.call(&Request::StartStream {
            client_pid: self.client_pid,
            target_pid: pid,
        })?;
        let (status, ring_path) = match response {
            Response::StartStream { status, ring_path } => (status, ring_path),
            other => {
                return Err(Error::Failure(format!(
                    "unexpected start-stream response {other:?}"
                )))
            }
        };
        if let Err(e) = status.into_result() {
            if matches!(e, Error::InvalidPid) {
                error!("cannot track pid {pid}: process does not exist");
            } else {
                error!("failed to begin tracking pid {pid}");
            }
            return Err(e);
        }

        if !self.stream_clients.contains_key(&pid) {
            let client = StreamClient::open(Path::new(&ring_path))?;
            self.stream_clients.insert(pid, client);
        }
        info!("started tracking pid {pid}");
        Ok(())
    }

    pub fn stop_streaming(&mut self, pid: u32) -> Result<()> {
        let response = self.control.call(&Request::StopStream {
            client_pid: self.client_pid,
            target_pid: pid,
        })?;
        match response {
            Response::StopStream { status } => status.into_result()?,
            other => {
                return Err(Error::Failure(format!(
                    "unexpected stop-stream response {other:?}"
                )))
            }
        }
        self.stream_clients.remove(&pid);
        Ok(())
    }

    pub fn set_telemetry_polling_period(&mut self, _device_id: u32, period_ms: u32) -> Result<()> {
        let response = self.control.call(&Request::SetTelemetryPeriod { period_ms })?;
        match response {
            Response::SetTelemetryPeriod { status } => status.into_result(),
            other => Err(Error::Failure(format!(
                "unexpected telemetry-period response {other:?}"
            ))),
        }
    }

    fn set_active_graphics_adapter(&mut self, device_id: u32) -> Result<()> {
        if self.active_device == Some(device_id) {
            return Ok(());
        }
        let index = self
            .gpus
            .iter()
            .find(|g| g.device_id == device_id)
            .map(|g| g.adapter_index)
            .ok_or(Error::InvalidAdapterId)?;
        let response = self.control.call(&Request::SelectAdapter { index })?;
        match response {
            Response::SelectAdapter { status } => status.into_result()?,
            other => {
                return Err(Error::Failure(format!(
                    "unexpected select-adapter response {other:?}"
                )))
            }
        }
        self.active_device = Some(device_id);
        Ok(())
    }

    /// Registers a dynamic query; element offsets and sizes are assigned in
    /// place.
    pub fn register_dynamic_query(
        &mut self,
        elements: &mut [QueryElement],
        window_size_ms: f64,
        metric_offset_ms: f64,
    ) -> Result<DynamicQueryHandle> {
        let gpu_ids: Vec<u32> = self.gpus.iter().map(|g| g.device_id).collect();
        let query = DynamicQuery::compile(elements, window_size_ms, metric_offset_ms, &gpu_ids)?;
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.dynamic_queries.insert(id, Arc::new(query));
        Ok(DynamicQueryHandle(id))
    }

    pub fn free_dynamic_query(&mut self, handle: DynamicQueryHandle) {
        self.dynamic_queries.remove(&handle.0);
        self.query_caches.retain(|(id, _), _| *id != handle.0);
        self.query_deltas.retain(|(id, _), _| *id != handle.0);
    }

    /// Registers a frame-event query; returns the handle and the row stride
    /// for the caller's blob.
    pub fn register_frame_query(
        &mut self,
        elements: &mut [QueryElement],
    ) -> Result<(FrameQueryHandle, usize)> {
        let query = FrameQuery::compile(elements)?;
        let blob_size = query.blob_size();
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.frame_queries.insert(id, Arc::new(query));
        Ok((FrameQueryHandle(id), blob_size))
    }

    pub fn free_frame_query(&mut self, handle: FrameQueryHandle) {
        self.frame_queries.remove(&handle.0);
    }

    /// Serves one static metric from the cached device table into `blob` at
    /// offset 0.
    pub fn poll_static_query(
        &mut self,
        element: &QueryElement,
        _pid: u32,
        blob: &mut [u8],
    ) -> Result<()> {
        if !element.metric.is_static() {
            error!("dynamic metric {:?} in static query poll", element.metric);
            return Err(Error::Failure("dynamic metric in static query poll".into()));
        }
        let mut qe = element.clone();
        qe.data_offset = 0;
        qe.data_size = qe.metric.polled_type().size();
        if blob.len() < qe.data_size {
            return Err(Error::Failure("static query blob too small".into()));
        }
        self.write_static_metric(&qe, blob);
        Ok(())
    }

    /// Polls a dynamic query over its retrospective window.
    ///
    /// Empty windows are not errors: the previous result for this
    /// `(query, pid)` is copied into `blob` instead. `num_swap_chains` is
    /// raised to the true chain count when the window saw more chains than
    /// the caller has row capacity for; only the dominant chain is emitted.
    pub fn poll_dynamic_query(
        &mut self,
        handle: DynamicQueryHandle,
        pid: u32,
        blob: &mut [u8],
        num_swap_chains: &mut u32,
    ) -> Result<()> {
        if *num_swap_chains == 0 {
            return Ok(());
        }
        let query = Arc::clone(
            self.dynamic_queries
                .get(&handle.0)
                .ok_or_else(|| Error::Failure("unknown dynamic query handle".into()))?,
        );
        if blob.len() < query.blob_size {
            return Err(Error::Failure("dynamic query blob too small".into()));
        }

        if let Some(device_index) = query.device_index {
            if self.current_gpu_index != Some(device_index) {
                let device_id = self.gpus[device_index].device_id;
                if let Err(e) = self.set_active_graphics_adapter(device_id) {
                    warn!("could not select adapter {device_id}: {e}");
                }
                self.current_gpu_index = Some(device_index);
            }
        }

        let Some(client) = self.stream_clients.get(&pid) else {
            return Ok(());
        };
        let header = client.view().header();
        if !header.process_active {
            return Ok(());
        }

        let frequency = header.qpc_frequency;
        let timebase = TraceTimebase::new(frequency);
        let mut window_ms = query.window_size_ms;
        let metric_offset_qpc = ms_to_qpc(query.metric_offset_ms, frequency);
        let stored_delta = self.query_deltas.entry((handle.0, pid)).or_insert(0);

        let start = find_window_start(
            client,
            metric_offset_qpc,
            stored_delta,
            &mut window_ms,
            &self.clock,
        );
        let Some((start_idx, start_record)) = start else {
            copy_cache(&self.query_caches, (handle.0, pid), blob);
            return Ok(());
        };

        // Walk backward until the window is covered or the ring runs out,
        // then process oldest-first.
        let end_qpc = start_record
            .present_start_time
            .saturating_sub(ms_to_qpc(window_ms, frequency));
        let mut frames: Vec<FrameRecord> = Vec::new();
        let mut index = start_idx;
        let mut frame = start_record;
        while frame.present_start_time > end_qpc {
            frames.push(frame);
            match client.view().decrement_index(index) {
                None => break,
                Some(prev) => {
                    index = prev;
                    match client.read_by_index(prev) {
                        Some(f) => frame = f,
                        None => break,
                    }
                }
            }
        }

        let mut chains: FastHashMap<u64, SwapChainState> = FastHashMap::default();
        let mut arrays = MetricArrays::default();
        for frame in frames.iter().rev() {
            if query.accum_fps_data {
                chains
                    .entry(frame.swap_chain)
                    .or_default()
                    .process_present(&timebase, *frame);
            }
            accumulate_gpu(query.accum_gpu_bits, &frame.power, &mut arrays);
            accumulate_cpu(query.accum_cpu_bits, &frame.cpu, &mut arrays);
        }

        self.materialize_dynamic(&query, handle.0, pid, blob, num_swap_chains, chains, arrays);
        Ok(())
    }

    /// Consumes up to `num_frames` unread presents into per-frame rows.
    pub fn consume_frame_events(
        &mut self,
        handle: FrameQueryHandle,
        pid: u32,
        blob: &mut [u8],
        num_frames: &mut u32,
    ) -> Result<()> {
        let capacity = *num_frames;
        // Reset up-front so an error path reports zero rows.
        *num_frames = 0;

        let query = Arc::clone(
            self.frame_queries
                .get(&handle.0)
                .ok_or_else(|| Error::Failure("unknown frame query handle".into()))?,
        );

        if !self.stream_clients.contains_key(&pid) {
            info!("no stream client for pid {pid}; call start_streaming first");
            return Err(Error::StreamNotFound(pid));
        }
        if !self.stream_clients[&pid].view().header().process_active {
            let _ = self.stop_streaming(pid);
            info!("process death detected while consuming frame events");
            return Err(Error::ProcessGone);
        }

        if let Some(device_id) = query.referenced_device() {
            if let Err(e) = self.set_active_graphics_adapter(device_id) {
                warn!("could not select adapter {device_id}: {e}");
            }
        }

        let stride = query.blob_size();
        if blob.len() < capacity as usize * stride {
            return Err(Error::Failure("frame query blob too small".into()));
        }

        let Some(client) = self.stream_clients.get_mut(&pid) else {
            return Err(Error::StreamNotFound(pid));
        };
        if client.latest_frame_index().is_none() {
            return Ok(());
        }
        let header = client.view().header();
        let timebase = TraceTimebase::new(header.qpc_frequency);
        let start_qpc = header.start_qpc;

        let mut copied = 0u32;
        for _ in 0..capacity {
            let Some(set) = client.consume_next()? else {
                break;
            };
            // A row needs the preceding present for its CPU start; records
            // without one are consumed but produce no output.
            let Some(last_presented) = set.last_presented.as_ref() else {
                continue;
            };
            let ctx = FrameContext {
                timebase,
                start_qpc,
                current: &set.current,
                next_displayed: &set.next_displayed,
                last_presented,
                last_displayed: set.last_displayed.as_ref(),
                prev_of_last_displayed: set.prev_of_last_displayed.as_ref(),
            };
            let offset = copied as usize * stride;
            query.gather_row(&ctx, &mut blob[offset..offset + stride]);
            copied += 1;
        }
        *num_frames = copied;
        Ok(())
    }

    fn materialize_dynamic(
        &mut self,
        query: &DynamicQuery,
        query_id: u64,
        pid: u32,
        blob: &mut [u8],
        num_swap_chains: &mut u32,
        mut chains: FastHashMap<u64, SwapChainState>,
        mut arrays: MetricArrays,
    ) {
        // Pick the chain with the most frame metrics; with more chains than
        // caller capacity, report the true count but emit only that one.
        let dominant = chains
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, chain))| chain.num_frames())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut copy_all = true;
        if chains.len() as u32 > *num_swap_chains {
            *num_swap_chains = chains.len() as u32;
            copy_all = false;
        }

        let mut use_cache = false;
        let mut all_metrics_calculated = false;
        for (i, (addr, chain)) in chains.iter_mut().enumerate() {
            // All-dropped or empty windows cannot produce fps metrics;
            // fall back to the cached result.
            if chain.display_count <= 1 && chain.num_frames() == 0 {
                use_cache = true;
                break;
            }
            if !copy_all && i != dominant {
                continue;
            }
            for qe in &query.elements {
                match qe.metric {
                    Metric::SwapChainAddress => write_u64(blob, qe.data_offset, *addr),
                    m if m.is_static() => self.write_static_metric(qe, blob),
                    Metric::GpuMemUtilization => {
                        let v = self.gpu_mem_utilization(&mut arrays, qe.stat);
                        write_f64(blob, qe.data_offset, v);
                    }
                    m if m.is_frame_bucket() => write_chain_metric(chain, qe, blob),
                    _ => write_telemetry_metric(&mut arrays, qe, blob),
                }
            }
            all_metrics_calculated = true;
        }

        if use_cache {
            copy_cache(&self.query_caches, (query_id, pid), blob);
            return;
        }

        // No chain produced frame metrics (telemetry-only query or no
        // presents); telemetry and static elements still get served.
        if !all_metrics_calculated {
            for qe in &query.elements {
                match qe.metric {
                    m if m.is_static() => self.write_static_metric(qe, blob),
                    Metric::GpuMemUtilization => {
                        let v = self.gpu_mem_utilization(&mut arrays, qe.stat);
                        write_f64(blob, qe.data_offset, v);
                    }
                    m if m.is_frame_bucket() => {}
                    _ => write_telemetry_metric(&mut arrays, qe, blob),
                }
            }
        }

        self.query_caches
            .insert((query_id, pid), blob[..query.blob_size].to_vec());
    }

    fn write_static_metric(&self, qe: &QueryElement, blob: &mut [u8]) {
        let gpu = self.gpus.iter().find(|g| g.device_id == qe.device_id);
        match qe.metric {
            Metric::CpuName => {
                let name = self.cpu.as_ref().map(|c| c.name.as_bytes()).unwrap_or(b"");
                write_string(blob, qe.data_offset, qe.data_size, name);
            }
            Metric::CpuVendor => {
                let vendor = self
                    .cpu
                    .as_ref()
                    .map(|c| c.vendor)
                    .unwrap_or(DeviceVendor::Unknown);
                write_u32(blob, qe.data_offset, vendor as u32);
            }
            Metric::CpuPowerLimit => {
                let limit = self.cpu.as_ref().and_then(|c| c.power_limit).unwrap_or(0.0);
                write_f64(blob, qe.data_offset, limit);
            }
            Metric::GpuName => {
                let name = gpu.map(|g| g.name.as_bytes()).unwrap_or(b"");
                write_string(blob, qe.data_offset, qe.data_size, name);
            }
            Metric::GpuVendor => {
                let vendor = gpu.map(|g| g.vendor).unwrap_or(DeviceVendor::Unknown);
                write_u32(blob, qe.data_offset, vendor as u32);
            }
            Metric::GpuMemSize => {
                let v = gpu.and_then(|g| g.gpu_memory_size).unwrap_or(0) as f64;
                write_f64(blob, qe.data_offset, v);
            }
            Metric::GpuMemMaxBandwidth => {
                let v = gpu.and_then(|g| g.gpu_memory_max_bandwidth).unwrap_or(0) as f64;
                write_f64(blob, qe.data_offset, v);
            }
            Metric::GpuSustainedPowerLimit => {
                let v = gpu.and_then(|g| g.gpu_sustained_power_limit).unwrap_or(0.0);
                write_f64(blob, qe.data_offset, v);
            }
            _ => {}
        }
    }

    /// Memory utilization is derived from the gathered memory-used series
    /// and the adapter's static memory size.
    fn gpu_mem_utilization(&self, arrays: &mut MetricArrays, stat: Stat) -> f64 {
        let index = self.current_gpu_index.unwrap_or(0);
        let Some(memory_size) = self
            .gpus
            .get(index)
            .and_then(|g| g.gpu_memory_size)
            .filter(|size| *size != 0)
        else {
            return 0.0;
        };
        let Some(used) = arrays
            .get(&Metric::GpuMemUsed)
            .and_then(|info| info.data.get(&0))
        else {
            return 0.0;
        };
        let mut utilization: Vec<f64> = used
            .iter()
            .map(|used| 100.0 * used / memory_size as f64)
            .collect();
        evaluate(&mut utilization, stat)
    }
}

fn enumerate_adapters(control: &mut ControlChannel) -> Result<Vec<AdapterInfo>> {
    let response = control
        .call(&Request::EnumerateAdapters)
        .map_err(|_| Error::IntrospectionUnreachable)?;
    match response {
        Response::EnumerateAdapters { status, adapters } => {
            status.into_result().map_err(|_| Error::IntrospectionDecode)?;
            Ok(adapters)
        }
        // A mismatched response variant means the channel is out of frame.
        _ => Err(Error::PipeMode),
    }
}

fn infer_cpu_vendor(name: &str) -> DeviceVendor {
    let lower = name.to_ascii_lowercase();
    if lower.contains("intel") {
        DeviceVendor::Intel
    } else if lower.contains("amd") {
        DeviceVendor::Amd
    } else {
        DeviceVendor::Unknown
    }
}

/// Aligns the client clock against the producer's newest record and finds
/// the slot where the poll window ends.
///
/// Returns `None` for an empty window. A metric offset of zero anchors the
/// window at the newest record without consulting the clock.
fn find_window_start(
    client: &StreamClient,
    metric_offset_qpc: u64,
    stored_delta: &mut u64,
    window_ms: &mut f64,
    clock: &QpcClock,
) -> Option<(u64, FrameRecord)> {
    let header = client.view().header();
    if !header.process_active {
        return None;
    }
    let mut index = client.latest_frame_index()?;
    let mut frame = client.read_by_index(index)?;
    if metric_offset_qpc == 0 {
        return Some((index, frame));
    }

    let now = (clock)(header.qpc_frequency);
    let adjusted = adjusted_qpc(now, frame.present_start_time, metric_offset_qpc, stored_delta);

    if adjusted > frame.present_start_time {
        // The window end lies beyond the newest record: shrink the window by
        // the gap; an exhausted window serves the cache.
        let timebase = TraceTimebase::new(header.qpc_frequency);
        *window_ms -= timebase.delta_ms(adjusted - frame.present_start_time);
        if *window_ms <= 0.0 {
            return None;
        }
    } else {
        // Step back to the newest record at or before the adjusted time.
        loop {
            match client.view().decrement_index(index) {
                None => break,
                Some(prev) => {
                    index = prev;
                    frame = client.read_by_index(prev)?;
                    if adjusted >= frame.present_start_time {
                        break;
                    }
                }
            }
        }
    }
    Some((index, frame))
}

/// Stabilized client-to-producer clock alignment: the stored delta holds
/// until drift exceeds [`CLIENT_FRAME_DELTA_THRESHOLD`], then rebinds.
fn adjusted_qpc(now: u64, frame_qpc: u64, metric_offset_qpc: u64, stored_delta: &mut u64) -> u64 {
    let current_delta = now.wrapping_sub(frame_qpc);
    if *stored_delta == 0 {
        *stored_delta = current_delta;
    } else if (*stored_delta as i64)
        .wrapping_sub(current_delta as i64)
        .unsigned_abs()
        > CLIENT_FRAME_DELTA_THRESHOLD
    {
        *stored_delta = current_delta;
    }
    now.wrapping_sub(stored_delta.wrapping_add(metric_offset_qpc))
}

fn copy_cache(caches: &FastHashMap<(u64, u32), Vec<u8>>, key: (u64, u32), blob: &mut [u8]) {
    if let Some(cached) = caches.get(&key) {
        blob[..cached.len()].copy_from_slice(cached);
    }
}

/// Writes one frame-bucket metric for a chain: scalar-per-chain values come
/// from the last present, series metrics through the statistic evaluator.
fn write_chain_metric(chain: &mut SwapChainState, qe: &QueryElement, blob: &mut [u8]) {
    let offset = qe.data_offset;
    match qe.metric {
        Metric::Application => write_string(
            blob,
            offset,
            qe.data_size,
            chain.last_present().application_bytes(),
        ),
        Metric::PresentMode => write_u32(blob, offset, chain.last_present().present_mode),
        Metric::PresentRuntime => write_u32(blob, offset, chain.last_present().runtime),
        Metric::PresentFlags => write_u32(blob, offset, chain.last_present().present_flags),
        Metric::SyncInterval => write_i32(blob, offset, chain.last_present().sync_interval),
        Metric::AllowsTearing => {
            write_bool(blob, offset, chain.last_present().supports_tearing != 0)
        }
        Metric::FrameType => write_u32(blob, offset, chain.last_present().frame_type),
        Metric::CpuBusy => write_f64(blob, offset, evaluate(&mut chain.cpu_busy, qe.stat)),
        Metric::CpuWait => write_f64(blob, offset, evaluate(&mut chain.cpu_wait, qe.stat)),
        Metric::CpuFrameTime => {
            write_f64(blob, offset, evaluate(&mut chain.frame_times_ms(), qe.stat))
        }
        Metric::GpuLatency => write_f64(blob, offset, evaluate(&mut chain.gpu_latency, qe.stat)),
        Metric::GpuBusy => write_f64(blob, offset, evaluate(&mut chain.gpu_busy, qe.stat)),
        Metric::GpuWait => write_f64(blob, offset, evaluate(&mut chain.gpu_wait, qe.stat)),
        Metric::GpuTime => write_f64(blob, offset, evaluate(&mut chain.gpu_times_ms(), qe.stat)),
        Metric::GpuVideoBusy => write_f64(blob, offset, evaluate(&mut chain.video_busy, qe.stat)),
        Metric::DisplayLatency => {
            write_f64(blob, offset, evaluate(&mut chain.display_latency, qe.stat))
        }
        Metric::DisplayedTime => {
            write_f64(blob, offset, evaluate(&mut chain.displayed_time, qe.stat))
        }
        Metric::AnimationError => {
            write_f64(blob, offset, evaluate(&mut chain.animation_error, qe.stat))
        }
        Metric::PresentedFps => write_f64(blob, offset, evaluate(&mut chain.presented_fps(), qe.stat)),
        Metric::ApplicationFps => {
            write_f64(blob, offset, evaluate(&mut chain.application_fps(), qe.stat))
        }
        Metric::DisplayedFps => {
            write_f64(blob, offset, evaluate(&mut chain.displayed_fps(), qe.stat))
        }
        Metric::DroppedFrames => write_f64(blob, offset, evaluate(&mut chain.dropped, qe.stat)),
        Metric::ClickToPhotonLatency => {
            write_f64(blob, offset, evaluate(&mut chain.click_to_photon, qe.stat))
        }
        Metric::CpuStartQpc => write_u64(blob, offset, 0),
        _ => write_f64(blob, offset, 0.0),
    }
}

fn write_telemetry_metric(arrays: &mut MetricArrays, qe: &QueryElement, blob: &mut [u8]) {
    // Telemetry values are all doubles; anything else landing here is an
    // unsupported combination and reads as zero.
    if qe.data_size != 8 {
        return;
    }
    let value = arrays
        .get_mut(&qe.metric)
        .and_then(|info| info.data.get_mut(&qe.array_index))
        .map(|series| evaluate(series, qe.stat))
        .unwrap_or(0.0);
    write_f64(blob, qe.data_offset, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{displayed_record, RingWriter};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A middleware with no live control connection; operations that touch
    /// the control channel report failures, everything else works.
    fn detached() -> Middleware {
        struct DeadTransport;
        impl std::io::Read for DeadTransport {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Ok(0)
            }
        }
        impl std::io::Write for DeadTransport {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        Middleware {
            control: ControlChannel::over(Box::new(DeadTransport)),
            client_pid: std::process::id(),
            stream_clients: FastHashMap::default(),
            gpus: Vec::new(),
            cpu: None,
            current_gpu_index: None,
            active_device: None,
            dynamic_queries: FastHashMap::default(),
            frame_queries: FastHashMap::default(),
            next_query_id: 1,
            query_caches: FastHashMap::default(),
            query_deltas: FastHashMap::default(),
            clock: monotonic_clock(),
        }
    }

    fn manual_clock(mw: &mut Middleware) -> Arc<AtomicU64> {
        let now = Arc::new(AtomicU64::new(0));
        let handle = Arc::clone(&now);
        mw.clock = Box::new(move |_| handle.load(Ordering::Relaxed));
        now
    }

    fn tracked_ring(mw: &mut Middleware, pid: u32, dir: &Path) -> RingWriter {
        let path = dir.join(format!("ring-{pid}"));
        // Freq 1000 makes one tick one millisecond.
        let mut w = RingWriter::create(&path, 64, 1000).unwrap();
        // Burn-in record so the first interesting present has a predecessor.
        w.push(&displayed_record(0x77, 500, 1));
        mw.stream_clients
            .insert(pid, StreamClient::open(&path).unwrap());
        w
    }

    fn fps_query(mw: &mut Middleware, window_ms: f64, offset_ms: f64) -> (DynamicQueryHandle, usize) {
        let mut elements = vec![
            QueryElement::new(Metric::PresentedFps, Stat::Avg),
            QueryElement::new(Metric::DroppedFrames, Stat::Avg),
        ];
        let handle = mw
            .register_dynamic_query(&mut elements, window_ms, offset_ms)
            .unwrap();
        let blob_size = elements.last().map(|e| e.data_offset + e.data_size).unwrap();
        (handle, blob_size)
    }

    fn read_f64(blob: &[u8], offset: usize) -> f64 {
        f64::from_ne_bytes(blob[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn poll_computes_windowed_averages() {
        let dir = tempfile::tempdir().unwrap();
        let mut mw = detached();
        let mut w = tracked_ring(&mut mw, 42, dir.path());
        for k in 0..7u64 {
            let mut r = displayed_record(0xabc, 1_000 + 6 * k, 1);
            r.frame_id = k as u32 + 1;
            w.push(&r);
        }

        let (handle, blob_size) = fps_query(&mut mw, 10_000.0, 0.0);
        let mut blob = vec![0u8; blob_size];
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();
        assert!((read_f64(&blob, 0) - 1000.0 / 6.0).abs() < 1e-6);
        assert_eq!(read_f64(&blob, 8), 0.0);
    }

    #[test]
    fn empty_window_returns_cached_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut mw = detached();
        let now = manual_clock(&mut mw);
        let mut w = tracked_ring(&mut mw, 42, dir.path());
        for k in 0..7u64 {
            let mut r = displayed_record(0xabc, 1_000 + 6 * k, 1);
            r.frame_id = k as u32 + 1;
            w.push(&r);
        }

        // Latest record is at 1036; with a 10-tick offset the first poll
        // lands inside the data.
        let (handle, blob_size) = fps_query(&mut mw, 30.0, 10.0);
        now.store(2_000, Ordering::Relaxed);
        let mut blob = vec![0u8; blob_size];
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();
        let cached = blob.clone();
        assert!(read_f64(&cached, 0) > 0.0);

        // Small clock advance: the stored delta holds, the adjusted time
        // runs past the newest record, and the shrunken window is empty.
        now.store(2_060, Ordering::Relaxed);
        let mut blob2 = vec![0xffu8; blob_size];
        let mut chains2 = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob2, &mut chains2).unwrap();
        assert_eq!(blob2, cached);
    }

    #[test]
    fn clock_jump_rebinds_the_stored_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut mw = detached();
        let now = manual_clock(&mut mw);
        let mut w = tracked_ring(&mut mw, 42, dir.path());
        for k in 0..7u64 {
            w.push(&displayed_record(0xabc, 1_000 + 6 * k, 1));
        }

        let (handle, blob_size) = fps_query(&mut mw, 30.0, 10.0);
        let mut blob = vec![0u8; blob_size];
        let mut chains = 4u32;

        now.store(2_000, Ordering::Relaxed);
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();
        let bound = mw.query_deltas[&(handle.0, 42)];
        assert_eq!(bound, 2_000 - 1_036);

        // Within the threshold the delta is stable.
        now.store(2_040, Ordering::Relaxed);
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();
        assert_eq!(mw.query_deltas[&(handle.0, 42)], bound);

        // Beyond the threshold it rebinds.
        let jumped = 2_000 + CLIENT_FRAME_DELTA_THRESHOLD + 1_000;
        now.store(jumped, Ordering::Relaxed);
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();
        assert_eq!(mw.query_deltas[&(handle.0, 42)], jumped - 1_036);
    }

    #[test]
    fn dead_process_polls_silently_and_frame_consume_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut mw = detached();
        let mut w = tracked_ring(&mut mw, 42, dir.path());
        w.push(&displayed_record(0xabc, 1_000, 1));
        w.set_process_active(false);

        let (handle, blob_size) = fps_query(&mut mw, 1_000.0, 0.0);
        let mut blob = vec![0u8; blob_size];
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 42, &mut blob, &mut chains).unwrap();

        let mut elements = vec![QueryElement::new(Metric::CpuBusy, Stat::Avg)];
        let (fq, stride) = mw.register_frame_query(&mut elements).unwrap();
        let mut rows = vec![0u8; stride * 8];
        let mut n = 8u32;
        let err = mw
            .consume_frame_events(fq, 42, &mut rows, &mut n)
            .unwrap_err();
        assert!(matches!(err, Error::ProcessGone));
        assert_eq!(n, 0);
    }

    #[test]
    fn missing_stream_fails_frame_consume_but_not_dynamic_poll() {
        let mut mw = detached();
        let (handle, blob_size) = fps_query(&mut mw, 1_000.0, 0.0);
        let mut blob = vec![0u8; blob_size];
        let mut chains = 4u32;
        mw.poll_dynamic_query(handle, 7, &mut blob, &mut chains).unwrap();

        let mut elements = vec![QueryElement::new(Metric::CpuBusy, Stat::Avg)];
        let (fq, stride) = mw.register_frame_query(&mut elements).unwrap();
        let mut rows = vec![0u8; stride * 4];
        let mut n = 4u32;
        assert!(matches!(
            mw.consume_frame_events(fq, 7, &mut rows, &mut n),
            Err(Error::StreamNotFound(7))
        ));
    }
}
