//! Configuration manager errors.

use crate::pulse::PulseError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by [`Context`](super::Context) operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Host or port information is missing from the options.
    #[error("endpoint information is missing")]
    MissingEndpoint,

    /// Protocol is not one of `tcp` or `udp`.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    /// Forwarding method is not one of `nat`, `tunnel` or `ipip`.
    #[error("unknown forwarding method '{0}'")]
    UnknownMethod(String),

    /// A scheduler flag token is not recognized.
    #[error("unknown scheduler flag '{0}'")]
    UnknownFlag(String),

    /// An object with this id is already registered.
    #[error("specified object already exists")]
    ObjectExists,

    /// No object with this id is registered.
    #[error("unable to locate specified object")]
    ObjectNotFound,

    /// Backend and service addresses belong to different address families.
    #[error("incompatible address families")]
    IncompatibleAFs,

    /// The IPVS driver reported a failure.
    ///
    /// Driver errors are abstracted to a single kind so the wire-level
    /// bindings stay replaceable; the underlying cause is logged at the
    /// call site.
    #[error("error while calling into IPVS")]
    IpvsSyscallFailed,

    /// Pulse options failed validation.
    #[error(transparent)]
    Pulse(#[from] PulseError),

    /// The external store rejected a write-through.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A host name could not be resolved.
    #[error("unable to resolve '{host}': {source}")]
    Resolve {
        /// The host that failed to resolve.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for configuration manager operations.
pub type CoreResult<T> = Result<T, CoreError>;
