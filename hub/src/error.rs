//! Error types for the `hub` crate.
//!
//! Follows the same pattern as the rest of the workspace: a root `Error`
//! struct holding an optional source and an error kind enum that callers
//! match on to decide how to react.

use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: HubErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum HubErrorKind {
    // A broadcast message could not be turned into JSON
    Serialization,
    // The coordinator task has stopped and no longer accepts intake events
    CoordinatorUnavailable,
    // Writing a frame to a client's socket failed
    Transport,
}

impl Error {
    pub fn coordinator_unavailable() -> Self {
        Error {
            source: None,
            error_kind: HubErrorKind::CoordinatorUnavailable,
        }
    }

    pub fn transport<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error {
            source: Some(Box::new(err)),
            error_kind: HubErrorKind::Transport,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Hub Error: {:?}: {source}", self.error_kind),
            None => write!(f, "Hub Error: {:?}", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: HubErrorKind::Serialization,
        }
    }
}
