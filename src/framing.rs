// framing.rs - length-prefixed record framing on a stream socket
// Copyright (C) 2018  David Anthony Stainton.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A frame is `LEN (u16, big-endian, includes itself)` followed by
//! exactly `LEN - 2` bytes of message. This module offers a blocking
//! read entry point for clients/peers and a partial-read entry point
//! for the server dispatcher's non-blocking readiness loop.

use std::io::{self, ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder};

use crate::constants::{FRAME_LEN_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use crate::errors::FramingError;

/// Serializes `payload` as one frame and writes it in a single call.
/// Partial writes are retried until the frame completes or the socket
/// fails.
pub fn send_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    let total_len = payload.len() + FRAME_LEN_SIZE;
    if total_len > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge(total_len));
    }
    let mut out = Vec::with_capacity(total_len);
    let mut len_bytes = [0u8; FRAME_LEN_SIZE];
    BigEndian::write_u16(&mut len_bytes, total_len as u16);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(payload);
    w.write_all(&out)?;
    Ok(())
}

/// Reads exactly one frame, blocking until it is fully available.
/// Returns the message payload (without the length prefix).
pub fn recv_frame_blocking<R: Read>(r: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_bytes = [0u8; FRAME_LEN_SIZE];
    r.read_exact(&mut len_bytes)?;
    let total_len = BigEndian::read_u16(&len_bytes) as usize;
    if total_len > MAX_FRAME_SIZE || total_len < MIN_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge(total_len));
    }
    let mut payload = vec![0u8; total_len - FRAME_LEN_SIZE];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// Per-connection state for cooperating with a non-blocking readiness
/// multiplexer: bytes accumulate here across multiple readiness
/// events until a full frame is available.
#[derive(Default)]
pub struct PartialReader {
    buf: Vec<u8>,
}

impl PartialReader {
    pub fn new() -> PartialReader {
        PartialReader { buf: Vec::new() }
    }

    /// Drains whatever bytes are currently available from `r` into the
    /// internal buffer, then returns a decoded frame payload if a
    /// complete frame has accumulated. Returns `Ok(None)` ("not ready")
    /// when more bytes are needed and the underlying read would block.
    pub fn poll<R: Read>(&mut self, r: &mut R) -> Result<Option<Vec<u8>>, FramingError> {
        let mut tmp = [0u8; 4096];
        loop {
            match r.read(&mut tmp) {
                Ok(0) => return Err(FramingError::ConnectionLost),
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.try_extract()
    }

    fn try_extract(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < FRAME_LEN_SIZE {
            return Ok(None);
        }
        let total_len = BigEndian::read_u16(&self.buf[..FRAME_LEN_SIZE]) as usize;
        if total_len > MAX_FRAME_SIZE || total_len < MIN_FRAME_SIZE {
            return Err(FramingError::FrameTooLarge(total_len));
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }
        let payload = self.buf[FRAME_LEN_SIZE..total_len].to_vec();
        self.buf.drain(..total_len);
        Ok(Some(payload))
    }
}

/// Writes `payload` with bounded retry on transient `WouldBlock`/`Interrupted`
/// errors, used by the dispatcher when writing to a non-blocking socket.
pub fn send_frame_nonblocking<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    let total_len = payload.len() + FRAME_LEN_SIZE;
    if total_len > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge(total_len));
    }
    let mut out = Vec::with_capacity(total_len);
    let mut len_bytes = [0u8; FRAME_LEN_SIZE];
    BigEndian::write_u16(&mut len_bytes, total_len as u16);
    out.extend_from_slice(&len_bytes);
    out.extend_from_slice(payload);
    let mut sent = 0usize;
    while sent < out.len() {
        match w.write(&out[sent..]) {
            Ok(0) => return Err(FramingError::ConnectionLost),
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Computes the on-wire frame length (length prefix included) for a
/// message payload of `payload_len` bytes. Used by the secure channel
/// to bind the AAD to the exact bytes the wire will carry.
pub fn frame_total_len(payload_len: usize) -> io::Result<u16> {
    let total = payload_len + FRAME_LEN_SIZE;
    if total > MAX_FRAME_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    Ok(total as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_blocking() {
        let payload = vec![0x01, 0xaa, 0xbb, 0xcc];
        let mut wire = Vec::new();
        send_frame(&mut wire, &payload).unwrap();
        assert_eq!(wire.len(), payload.len() + FRAME_LEN_SIZE);
        let mut cursor = Cursor::new(wire);
        let got = recv_frame_blocking(&mut cursor).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn frame_too_large_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_SIZE];
        let mut wire = Vec::new();
        let err = send_frame(&mut wire, &payload).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge(_)));
    }

    #[test]
    fn minimum_frame_size_is_three_bytes() {
        let payload = vec![0x01];
        let mut wire = Vec::new();
        send_frame(&mut wire, &payload).unwrap();
        assert_eq!(wire.len(), MIN_FRAME_SIZE);
    }

    #[test]
    fn partial_reader_accumulates_across_polls() {
        let payload = vec![0xaa; 10];
        let mut wire = Vec::new();
        send_frame(&mut wire, &payload).unwrap();

        let mut reader = PartialReader::new();
        let mut first_half = Cursor::new(wire[..6].to_vec());
        assert_eq!(reader.poll(&mut first_half).unwrap(), None);

        let mut second_half = Cursor::new(wire[6..].to_vec());
        let got = reader.poll(&mut second_half).unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn connection_lost_on_zero_read() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        let mut reader = PartialReader::new();
        let err = reader.poll(&mut empty).unwrap_err();
        assert!(matches!(err, FramingError::ConnectionLost));
    }
}
