//! Framed codec for worker-tracker connections.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Inbound and outbound message types differ, so one `Framed` stream carries
//! both directions of a connection.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{TrackerMessage, WorkerMessage};

/// Handshake frames are tiny; anything larger is a confused or hostile peer.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Codec that frames messages with a 4-byte length prefix and serializes with JSON.
///
/// `In` is decoded from the wire, `Out` is encoded onto it.
pub struct FrameCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<fn(Out) -> In>,
}

/// Codec used by the tracker side of a connection.
pub type TrackerCodec = FrameCodec<WorkerMessage, TrackerMessage>;

/// Codec used by the worker side of a connection.
pub type WorkerCodec = FrameCodec<TrackerMessage, WorkerMessage>;

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = io::Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
