use thiserror::Error;

/// Errors surfaced by the middleware.
///
/// Query operations prefer "success with zero rows" over errors for empty
/// windows; the variants here cover genuine failures and the small set of
/// conditions the client is expected to react to (`ProcessGone`,
/// `StreamNotFound`).
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("no frame data available")]
    NoData,

    #[error("frame data was lost by the capture service")]
    DataLoss,

    #[error("capture service reported an internal error")]
    ServiceError,

    #[error("process id is not valid")]
    InvalidPid,

    #[error("trace file is not valid")]
    InvalidEtlFile,

    #[error("adapter id is not valid")]
    InvalidAdapterId,

    #[error("process no longer exists")]
    ProcessNotExist,

    #[error("no stream registered for pid {0}; call start_streaming first")]
    StreamNotFound(u32),

    #[error("tracked process exited")]
    ProcessGone,

    #[error("could not connect control pipe: {0}")]
    PipeConnect(String),

    #[error("control pipe handshake failed")]
    PipeMode,

    #[error("adapter enumeration endpoint unreachable")]
    IntrospectionUnreachable,

    #[error("adapter enumeration response was malformed")]
    IntrospectionDecode,

    #[error("{0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
