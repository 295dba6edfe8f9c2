// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Wire format between the coordinator and the detection worker
//!
//! Every message is a little-endian `u32` length followed by a bincode body.
//! The worker reads [`CaptureControl`] from stdin and writes
//! [`WorkerMessage`]s to stdout.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for a single message body
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Coordinator to worker: pause or resume detection without restarting capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureControl {
    pub stop_processing: bool,
    pub sensitivity: u8,
}

/// Worker to coordinator liveness and metrics report, at most once a second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub pid: u32,
    pub running: bool,
    pub motion_detected: bool,
    /// Seconds spent on each frame since the previous heartbeat
    pub frame_processing_times: Vec<f64>,
}

/// Everything the worker sends, multiplexed on one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Heartbeat(WorkerHeartbeat),
    /// JPEG encoded grayscale preview frame
    Frame(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("message could not be encoded or decoded: {0}")]
    Codec(#[from] bincode::Error),

    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte limit")]
    TooLarge(usize),
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read the next message. `Ok(None)` means the peer closed the stream.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_of_messages() {
        let mut wire = Vec::new();
        let heartbeat = WorkerMessage::Heartbeat(WorkerHeartbeat {
            pid: 42,
            running: true,
            motion_detected: false,
            frame_processing_times: vec![0.01, 0.02],
        });
        write_message(&mut wire, &WorkerMessage::Frame(vec![1, 2, 3])).unwrap();
        write_message(&mut wire, &heartbeat).unwrap();

        let mut reader = Cursor::new(wire);
        let first: Option<WorkerMessage> = read_message(&mut reader).unwrap();
        assert_eq!(first, Some(WorkerMessage::Frame(vec![1, 2, 3])));
        let second: Option<WorkerMessage> = read_message(&mut reader).unwrap();
        assert_eq!(second, Some(heartbeat));
        let end: Option<WorkerMessage> = read_message(&mut reader).unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let mut wire = Vec::new();
        write_message(
            &mut wire,
            &CaptureControl {
                stop_processing: true,
                sensitivity: 50,
            },
        )
        .unwrap();
        wire.pop();

        let result: Result<Option<CaptureControl>, _> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let wire = (u32::MAX).to_le_bytes().to_vec();
        let result: Result<Option<WorkerMessage>, _> = read_message(&mut Cursor::new(wire));
        assert!(matches!(result, Err(ProtocolError::TooLarge(_))));
    }
}
