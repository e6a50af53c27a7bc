//! Control channel wire format
//!
//! Each message is a 4-byte little-endian length followed by a serialized
//! command or result record. A length of 0xFFFFFFFF or a truncated body is
//! a hard framing error that closes the connection.

use std::io::{Read, Write};

use anyhow::{bail, Context};

use crate::control::types::{ControlCommand, ControlResult};

/// Upper bound for a single message body
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Reads one length-prefixed frame. Returns None when the peer closed the
/// connection cleanly at a message boundary.
pub fn read_frame<R: Read>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(None);
    }

    let mut rest = [0u8; 3];
    reader
        .read_exact(&mut rest)
        .context("truncated message length")?;

    let length = u32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]);
    if length == u32::MAX {
        bail!("invalid message length");
    }
    if length > MAX_MESSAGE_SIZE {
        bail!("message of {} bytes exceeds the size limit", length);
    }

    let mut body = vec![0u8; length as usize];
    reader
        .read_exact(&mut body)
        .context("truncated message body")?;

    Ok(Some(body))
}

pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> anyhow::Result<()> {
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

pub fn read_command<R: Read>(reader: &mut R) -> anyhow::Result<Option<ControlCommand>> {
    let Some(body) = read_frame(reader)? else {
        return Ok(None);
    };

    Ok(Some(
        serde_json::from_slice(&body).context("invalid command record")?,
    ))
}

pub fn write_result<W: Write>(writer: &mut W, result: &ControlResult) -> anyhow::Result<()> {
    write_frame(writer, &serde_json::to_vec(result)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::types::Operation;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn command_roundtrip() {
        let cmd = ControlCommand::new(Operation::NoOperation);
        let mut buf = Vec::new();
        write_frame(&mut buf, &serde_json::to_vec(&cmd).unwrap()).unwrap();

        let mut cursor = Cursor::new(buf);
        let parsed = read_command(&mut cursor).unwrap().unwrap();
        assert_eq!(parsed.operation, Operation::NoOperation);
    }

    #[test]
    fn invalid_length_is_a_framing_error() {
        let mut cursor = Cursor::new(vec![0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn truncated_body_is_a_framing_error() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut cursor = Cursor::new((MAX_MESSAGE_SIZE + 1).to_le_bytes().to_vec());
        assert!(read_frame(&mut cursor).is_err());
    }
}
