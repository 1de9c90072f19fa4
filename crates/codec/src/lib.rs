//! ## Wire formats of the emoji relay
//!
//! Two very different streams meet in the relay. Upstream is the Jetstream
//! firehose, a websocket that delivers one JSON frame per repository
//! operation, most of which are of no interest here. Downstream are the
//! subscribers, which speak a tiny JSON protocol: they send filter updates
//! and receive client counts, emoji summaries and matching posts.
//!
//! This crate only knows how to read and write those frames and how to pull
//! the emoji out of a post. It does no I/O.

pub mod emoji;
pub mod event;
pub mod message;

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The frame is not valid JSON, or does not have the expected shape.
    Json(serde_json::Error),
    /// The frame is valid JSON but not a message the relay accepts.
    InvalidMessage,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "json error: {}", e),
            Self::InvalidMessage => write!(f, "{:?}", self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
