//! fault signaling for request and response processing
//!
//! header processing can only abort through one of these four variants, and
//! each one maps to exactly one action on the session

use thiserror::Error;

use crate::answers::AnswerKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayFault {
    /// send the canned status answer, then close
    #[error("sending back {0}")]
    Status(AnswerKind),
    /// send a 301/302 with the given location, then close
    #[error("redirecting to {location}")]
    Redirect { location: String, permanent: bool },
    /// close the connection without sending anything
    #[error("silent shutdown")]
    Silent,
    /// anything else; becomes a 500, or a 502 while the upstream connection
    /// is being established
    #[error("internal fault: {0}")]
    Internal(String),
}

impl RelayFault {
    pub fn internal<S: Into<String>>(message: S) -> RelayFault {
        RelayFault::Internal(message.into())
    }

    /// the status the client will see, used by the access log
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayFault::Status(kind) => Some((*kind).into()),
            RelayFault::Redirect { permanent, .. } => Some(if *permanent { 301 } else { 302 }),
            RelayFault::Silent => None,
            RelayFault::Internal(_) => Some(500),
        }
    }
}
