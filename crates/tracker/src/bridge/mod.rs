//! Wire bridge between the tracker and its workers.
//!
//! - **protocol**: Message types (WorkerMessage, TrackerMessage) and identifiers
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
