//! The closed error taxonomy used at the connection boundary (§4.7), plus
//! the small set of local/transport conditions the connection runtime and
//! buffer layer can surface.

use thiserror::Error;

use crate::buffer::NoBufferSpace;

/// A control-frame error kind. `Ok` is represented by `Result::Ok(())`
/// rather than a variant of this enum, matching the original's convention
/// that `CL_ERR_OK == 0` is simply "no error".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CtlError {
    #[error("connection closed")]
    Ended,
    #[error("connection moved")]
    Moved,
    #[error("internal error")]
    Internal,
    #[error("operation not permitted")]
    NoAuth,
    #[error("unknown cluster")]
    NoClus,
    #[error("invalid operation")]
    NoCtl,
    #[error("unknown filesystem")]
    NoFs,
    #[error("unknown host")]
    NoHost,
    #[error("unknown job")]
    NoJob,
    #[error("cannot allocate memory")]
    NoMem,
    #[error("unknown server")]
    NoServ,
    #[error("unknown user")]
    NoUser,
    #[error("unknown entity")]
    NoX,
    #[error("incorrect number of arguments")]
    NrArgs,
    #[error("invalid pair")]
    Which,
}

impl CtlError {
    /// The numeric code sent on the wire in a reply frame. Stable and
    /// arbitrary beyond "distinct per variant"; peers are expected to key
    /// off of the code, not the accompanying text.
    pub fn code(self) -> i32 {
        use CtlError::*;
        match self {
            Ended => 1,
            Moved => 2,
            Internal => 3,
            NoAuth => 4,
            NoClus => 5,
            NoCtl => 6,
            NoFs => 7,
            NoHost => 8,
            NoJob => 9,
            NoMem => 10,
            NoServ => 11,
            NoUser => 12,
            NoX => 13,
            NrArgs => 14,
            Which => 15,
        }
    }

    /// Lifecycle markers suppress the automatic reply frame and hand
    /// lifecycle control to the runtime's end path without writing.
    pub fn is_lifecycle_marker(self) -> bool {
        matches!(self, CtlError::Ended | CtlError::Moved)
    }
}

/// Errors the connection runtime's I/O paths can produce. Distinct from
/// [`CtlError`] because these end the connection rather than eliciting a
/// protocol-level reply.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("no buffer space")]
    NoBufferSpace(#[from] NoBufferSpace),
    #[error("idle timeout")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
