// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Worker wire protocol: `u32` little-endian length ‖ bincode payload.
//!
//! Outbound (reactor → worker) payloads are the bincode-encoded argument value.
//! Inbound (worker → reactor) payloads are a tagged record: one tag byte
//! ([`REPLY_TAG_RETURN`] or [`REPLY_TAG_ERROR`]) followed by the bincode-encoded
//! return value or error message.
//!
//! [`FrameConsumer`] adapts the inbound side to the stream consumer protocol,
//! deferring each complete frame to the owning pool so delivery happens outside
//! the stream's own dispatch (and strictly before the stream's close event).

use miette::IntoDiagnostic;
use serde::{Serialize, de::DeserializeOwned};

use super::WorkerId;
use crate::{notifier::NotifierId,
            stream::{ConsumeOutcome, StreamConsumer, StreamContext},
            worker::WorkerFailure};

/// Size of the length prefix on every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on a single frame payload; anything larger is a protocol error.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reply tag: the call returned a value.
pub const REPLY_TAG_RETURN: u8 = b'r';

/// Reply tag: the call failed; the body is the error message.
pub const REPLY_TAG_ERROR: u8 = b'e';

/// Serializes a payload value with the crate's standard bincode configuration.
pub fn try_encode<T: Serialize>(value: &T) -> miette::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode_config()).into_diagnostic()
}

/// Deserializes a payload produced by [`try_encode`].
pub fn try_decode<T: DeserializeOwned>(bytes: &[u8]) -> miette::Result<T> {
    let (value, _bytes_read) =
        bincode::serde::decode_from_slice::<T, _>(bytes, bincode_config()).into_diagnostic()?;
    Ok(value)
}

fn bincode_config() -> bincode::config::Configuration { bincode::config::standard() }

/// Prepends the length prefix.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental frame splitter over a growing buffer. `Ok(None)` means the buffer
/// holds no complete frame yet; `Ok(Some(payload))` drains one frame off the
/// front.
pub fn split_frame(buffer: &mut Vec<u8>) -> miette::Result<Option<Vec<u8>>> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buffer[..LENGTH_PREFIX_SIZE]);
    let length = u32::from_le_bytes(prefix);
    if length > MAX_FRAME_SIZE {
        miette::bail!("frame length {length} exceeds the {MAX_FRAME_SIZE}-byte cap");
    }
    let total = LENGTH_PREFIX_SIZE + length as usize;
    if buffer.len() < total {
        return Ok(None);
    }
    let payload = buffer[LENGTH_PREFIX_SIZE..total].to_vec();
    buffer.drain(..total);
    Ok(Some(payload))
}

/// Splits a reply payload into its tag and body, mapping error tags onto
/// [`WorkerFailure`].
pub(crate) fn parse_reply(payload: &[u8]) -> Result<Vec<u8>, WorkerFailure> {
    match payload.split_first() {
        Some((&REPLY_TAG_RETURN, body)) => Ok(body.to_vec()),
        Some((&REPLY_TAG_ERROR, body)) => Err(WorkerFailure::Error(
            try_decode::<String>(body)
                .unwrap_or_else(|_| "undecodable worker error".to_string()),
        )),
        _ => Err(WorkerFailure::Error("empty worker reply".to_string())),
    }
}

/// Stream consumer for a worker's result channel. Complete frames are deferred to
/// the pool (FIFO with the stream-closed event, also deferred) so completions run
/// outside the stream's dispatch.
pub(crate) struct FrameConsumer {
    pool: NotifierId,
    worker: WorkerId,
}

impl FrameConsumer {
    pub fn new(pool: NotifierId, worker: WorkerId) -> Self { Self { pool, worker } }
}

impl StreamConsumer for FrameConsumer {
    fn consume(
        &mut self,
        cx: &mut StreamContext<'_>,
        _eof: bool,
    ) -> miette::Result<ConsumeOutcome> {
        match split_frame(cx.buffer())? {
            Some(payload) => {
                let (pool, worker) = (self.pool, self.worker);
                cx.reactor().defer(move |r| {
                    r.deliver_worker_frame(pool, worker, payload);
                    Ok(())
                });
                Ok(ConsumeOutcome::Again)
            }
            None => Ok(ConsumeOutcome::NeedMore),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_frame_round_trip_through_splitter() {
        let payload = try_encode(&(7i32, "hello".to_string())).unwrap();
        let mut buffer = encode_frame(&payload);

        let split = split_frame(&mut buffer).unwrap().unwrap();
        assert_eq!(split, payload);
        assert!(buffer.is_empty());

        let decoded: (i32, String) = try_decode(&split).unwrap();
        assert_eq!(decoded, (7, "hello".to_string()));
    }

    #[test]
    fn test_split_waits_for_complete_frame() {
        let payload = try_encode(&"incremental".to_string()).unwrap();
        let frame = encode_frame(&payload);

        let mut buffer = Vec::new();
        for &byte in &frame[..frame.len() - 1] {
            buffer.push(byte);
            assert!(split_frame(&mut buffer).unwrap().is_none());
        }
        buffer.push(frame[frame.len() - 1]);
        assert_eq!(split_frame(&mut buffer).unwrap(), Some(payload));
    }

    #[test]
    fn test_split_handles_back_to_back_frames() {
        let first = try_encode(&1u8).unwrap();
        let second = try_encode(&2u8).unwrap();
        let mut buffer = encode_frame(&first);
        buffer.extend_from_slice(&encode_frame(&second));

        assert_eq!(split_frame(&mut buffer).unwrap(), Some(first));
        assert_eq!(split_frame(&mut buffer).unwrap(), Some(second));
        assert_eq!(split_frame(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let mut buffer = (MAX_FRAME_SIZE + 1).to_le_bytes().to_vec();
        buffer.extend_from_slice(b"junk");
        assert!(split_frame(&mut buffer).is_err());
    }

    #[test]
    fn test_parse_reply_tags() {
        let mut ok = vec![REPLY_TAG_RETURN];
        ok.extend_from_slice(&try_encode(&49i32).unwrap());
        let body = parse_reply(&ok).unwrap();
        assert_eq!(try_decode::<i32>(&body).unwrap(), 49);

        let mut err = vec![REPLY_TAG_ERROR];
        err.extend_from_slice(&try_encode(&"boom".to_string()).unwrap());
        match parse_reply(&err) {
            Err(WorkerFailure::Error(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }

        assert!(parse_reply(&[]).is_err());
    }
}
