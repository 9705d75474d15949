//! Control channel to the capture service.
//!
//! A synchronous request/response protocol: each message is serialized and
//! length-prefixed onto a blocking byte transport. The production transport
//! is the service's local socket; tests substitute an in-memory pair.

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Budget for connecting while the service endpoint is busy.
const CONNECT_RETRY_BUDGET: Duration = Duration::from_secs(20);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Wire status attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    NoData,
    DataLoss,
    ServiceError,
    InvalidPid,
    InvalidEtlFile,
    InvalidAdapterId,
    ProcessNotExist,
    Failure,
}

impl Status {
    pub fn into_result(self) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::NoData => Err(Error::NoData),
            Status::DataLoss => Err(Error::DataLoss),
            Status::ServiceError => Err(Error::ServiceError),
            Status::InvalidPid => Err(Error::InvalidPid),
            Status::InvalidEtlFile => Err(Error::InvalidEtlFile),
            Status::InvalidAdapterId => Err(Error::InvalidAdapterId),
            Status::ProcessNotExist => Err(Error::ProcessNotExist),
            Status::Failure => Err(Error::Failure("service call failed".into())),
        }
    }
}

/// Hardware vendor of a device reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum DeviceVendor {
    Unknown = 0,
    Intel = 1,
    Amd = 2,
    Nvidia = 3,
}

/// One graphics adapter as enumerated by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub id: u32,
    pub vendor: DeviceVendor,
    pub name: String,
    pub gpu_sustained_power_limit: f64,
    pub gpu_memory_size: u64,
    pub gpu_memory_max_bandwidth: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    StartStream { client_pid: u32, target_pid: u32 },
    StopStream { client_pid: u32, target_pid: u32 },
    EnumerateAdapters,
    SelectAdapter { index: u32 },
    SetTelemetryPeriod { period_ms: u32 },
    GetStaticCpuMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    StartStream { status: Status, ring_path: String },
    StopStream { status: Status },
    EnumerateAdapters { status: Status, adapters: Vec<AdapterInfo> },
    SelectAdapter { status: Status },
    SetTelemetryPeriod { status: Status },
    StaticCpuMetrics { status: Status, cpu_name: String, cpu_power_limit: f64 },
}

pub trait ControlTransport: Read + Write + Send {}
impl<T: Read + Write + Send> ControlTransport for T {}

pub struct ControlChannel {
    stream: Box<dyn ControlTransport>,
    buf: Vec<u8>,
}

impl ControlChannel {
    /// Wraps an already-connected transport.
    pub fn over(stream: Box<dyn ControlTransport>) -> ControlChannel {
        ControlChannel {
            stream,
            buf: Vec::new(),
        }
    }

    /// Connects to the service's local socket, retrying while the endpoint
    /// is busy or not yet listening.
    #[cfg(unix)]
    pub fn connect(path: &std::path::Path) -> Result<ControlChannel> {
        use std::io::ErrorKind;

        let deadline = std::time::Instant::now() + CONNECT_RETRY_BUDGET;
        loop {
            match std::os::unix::net::UnixStream::connect(path) {
                Ok(stream) => return Ok(ControlChannel::over(Box::new(stream))),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::WouldBlock
                    ) =>
                {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::PipeConnect(e.to_string()));
                    }
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(e) => return Err(Error::PipeConnect(e.to_string())),
            }
        }
    }

    /// Sends one request and blocks for its response.
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        self.send(request)?;
        self.receive()
    }

    fn send(&mut self, request: &Request) -> Result<()> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, request)
            .map_err(|e| Error::Failure(format!("could not encode control request: {e}")))?;
        let len = u32::try_from(self.buf.len())
            .map_err(|_| Error::Failure("control request too large".into()))?;
        self.stream
            .write_all(&len.to_be_bytes())
            .and_then(|()| self.stream.write_all(&self.buf))
            .and_then(|()| self.stream.flush())
            .map_err(|e| Error::Failure(format!("control pipe write failed: {e}")))
    }

    fn receive(&mut self) -> Result<Response> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .map_err(|e| Error::Failure(format!("control pipe read failed: {e}")))?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        self.buf.resize(len, 0);
        self.stream
            .read_exact(&mut self.buf)
            .map_err(|e| Error::Failure(format!("control pipe read failed: {e}")))?;
        serde_json::from_slice(&self.buf)
            .map_err(|e| Error::Failure(format!("could not decode control response: {e}")))
    }
}

/// Serves one side of a control conversation; used by test harnesses that
/// play the capture service.
#[doc(hidden)]
pub fn read_request(stream: &mut impl Read) -> std::io::Result<Request> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let mut buf = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    stream.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(std::io::Error::other)
}

#[doc(hidden)]
pub fn write_response(stream: &mut impl Write, response: &Response) -> std::io::Result<()> {
    let buf = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    stream.write_all(&(buf.len() as u32).to_be_bytes())?;
    stream.write_all(&buf)?;
    stream.flush()
}
