// codec.rs - wire codec: typed messages <-> byte buffers
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

//! Typed messages and their deterministic, bounds-checked
//! serialization. Every primitive read/write takes the remaining
//! buffer into account and fails closed rather than panicking on a
//! truncated or oversized field.

use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ByteOrder};

use crate::constants::{IDENTITY_FIELD_SIZE, MAX_USERNAME_LENGTH, P256_PUBLIC_KEY_SIZE};
use crate::errors::CodecError;

/// A cursor over an immutable byte slice, used for bounds-checked reads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    /// Bytes remaining after the current cursor position.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::BufferTooSmall);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    /// A fixed-width, NUL-padded identity field.
    pub fn read_identity(&mut self) -> Result<String, CodecError> {
        let raw = self.take(IDENTITY_FIELD_SIZE)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let bytes = &raw[..end.min(MAX_USERNAME_LENGTH)];
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidLength)
    }

    /// A `u32`-length-prefixed opaque buffer.
    pub fn read_opaque(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// A fixed-size SEC1-compressed P-256 public key, no length prefix.
    pub fn read_fixed_public_key(&mut self) -> Result<[u8; P256_PUBLIC_KEY_SIZE], CodecError> {
        let raw = self.take(P256_PUBLIC_KEY_SIZE)?;
        let mut out = [0u8; P256_PUBLIC_KEY_SIZE];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn read_socket_addr_v4(&mut self) -> Result<SocketAddrV4, CodecError> {
        let raw = self.take(4)?;
        let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
        let port = self.read_u16()?;
        Ok(SocketAddrV4::new(ip, port))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let r = &self.buf[self.pos..];
        self.pos = self.buf.len();
        r
    }
}

/// An append-only byte buffer used for bounds-checked writes.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(if v { 1 } else { 0 });
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    /// Writes an identity as a fixed `IDENTITY_FIELD_SIZE`-byte, NUL-padded field.
    pub fn write_identity(&mut self, id: &str) -> Result<(), CodecError> {
        let bytes = id.as_bytes();
        if bytes.len() > MAX_USERNAME_LENGTH {
            return Err(CodecError::InvalidLength);
        }
        self.buf.extend_from_slice(bytes);
        self.buf.resize(self.buf.len() + (IDENTITY_FIELD_SIZE - bytes.len()), 0);
        Ok(())
    }

    pub fn write_opaque(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn write_fixed_public_key(&mut self, key: &[u8; P256_PUBLIC_KEY_SIZE]) {
        self.buf.extend_from_slice(key);
    }

    pub fn write_socket_addr_v4(&mut self, addr: &SocketAddrV4) {
        self.buf.extend_from_slice(&addr.ip().octets());
        self.write_u16(addr.port());
    }

    pub fn write_bytes(&mut self, raw: &[u8]) {
        self.buf.extend_from_slice(raw);
    }
}

/// Tag bytes for every message type (§4.1). `SECURE_MESSAGE` is pinned
/// to `SECURE_MESSAGE_TAG` for AAD determinism, see `constants.rs`.
pub mod tag {
    pub const SECURE_MESSAGE: u8 = crate::constants::SECURE_MESSAGE_TAG;
    pub const CLIENT_HELLO: u8 = 0x02;
    pub const SERVER_HELLO: u8 = 0x03;
    pub const CLIENT_VERIFY: u8 = 0x04;
    pub const CERT_REQ: u8 = 0x05;
    pub const CERTIFICATE: u8 = 0x06;
    pub const REGISTER: u8 = 0x07;
    pub const USERS_LIST_REQ: u8 = 0x08;
    pub const USERS_LIST: u8 = 0x09;
    pub const CHALLENGE: u8 = 0x0a;
    pub const CHALLENGE_FWD: u8 = 0x0b;
    pub const CHALLENGE_RESP: u8 = 0x0c;
    pub const GAME_START: u8 = 0x0d;
    pub const GAME_CANCEL: u8 = 0x0e;
    pub const GAME_END: u8 = 0x0f;
    pub const START_GAME_PEER: u8 = 0x10;
    pub const MOVE: u8 = 0x11;
}

/// The discriminated message set of §4.1's inventory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SecureMessage {
        ciphertext: Vec<u8>,
        tag: [u8; 16],
    },
    ClientHello {
        client_nonce: u32,
        my_id: String,
        peer_id: String,
        ephemeral_public_key: [u8; P256_PUBLIC_KEY_SIZE],
    },
    ServerHello {
        server_nonce: u32,
        my_id: String,
        peer_id: String,
        signature: Vec<u8>,
        ephemeral_public_key: [u8; P256_PUBLIC_KEY_SIZE],
    },
    ClientVerify {
        signature: Vec<u8>,
    },
    CertReq,
    Certificate {
        cert: Vec<u8>,
    },
    Register {
        identity: String,
    },
    UsersListReq {
        offset: u32,
    },
    UsersList {
        identities: Vec<String>,
    },
    Challenge {
        opponent: String,
    },
    ChallengeFwd {
        challenger: String,
    },
    ChallengeResp {
        accept: bool,
        listen_port: u16,
        challenger_id: String,
    },
    GameStart {
        opponent: String,
        addr: SocketAddrV4,
        opponent_cert: Vec<u8>,
    },
    GameCancel {
        opponent: String,
    },
    GameEnd,
    StartGamePeer,
    Move {
        column: u8,
    },
}

impl Message {
    /// The tag byte this variant encodes to.
    pub fn tag(&self) -> u8 {
        match *self {
            Message::SecureMessage { .. } => tag::SECURE_MESSAGE,
            Message::ClientHello { .. } => tag::CLIENT_HELLO,
            Message::ServerHello { .. } => tag::SERVER_HELLO,
            Message::ClientVerify { .. } => tag::CLIENT_VERIFY,
            Message::CertReq => tag::CERT_REQ,
            Message::Certificate { .. } => tag::CERTIFICATE,
            Message::Register { .. } => tag::REGISTER,
            Message::UsersListReq { .. } => tag::USERS_LIST_REQ,
            Message::UsersList { .. } => tag::USERS_LIST,
            Message::Challenge { .. } => tag::CHALLENGE,
            Message::ChallengeFwd { .. } => tag::CHALLENGE_FWD,
            Message::ChallengeResp { .. } => tag::CHALLENGE_RESP,
            Message::GameStart { .. } => tag::GAME_START,
            Message::GameCancel { .. } => tag::GAME_CANCEL,
            Message::GameEnd => tag::GAME_END,
            Message::StartGamePeer => tag::START_GAME_PEER,
            Message::Move { .. } => tag::MOVE,
        }
    }

    /// Encodes this message to a tag byte followed by its payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(self.tag());
        match *self {
            Message::SecureMessage { ref ciphertext, ref tag } => {
                // Ciphertext length is implicit: whatever remains in the
                // frame after the trailing 16-byte authentication tag.
                w.write_bytes(ciphertext);
                w.write_bytes(tag);
            }
            Message::ClientHello {
                client_nonce,
                ref my_id,
                ref peer_id,
                ref ephemeral_public_key,
            } => {
                w.write_u32(client_nonce);
                w.write_identity(my_id).expect("identity validated at construction");
                w.write_identity(peer_id).expect("identity validated at construction");
                w.write_fixed_public_key(ephemeral_public_key);
            }
            Message::ServerHello {
                server_nonce,
                ref my_id,
                ref peer_id,
                ref signature,
                ref ephemeral_public_key,
            } => {
                w.write_u32(server_nonce);
                w.write_identity(my_id).expect("identity validated at construction");
                w.write_identity(peer_id).expect("identity validated at construction");
                w.write_opaque(signature);
                w.write_fixed_public_key(ephemeral_public_key);
            }
            Message::ClientVerify { ref signature } => {
                w.write_opaque(signature);
            }
            Message::CertReq => {}
            Message::Certificate { ref cert } => {
                w.write_opaque(cert);
            }
            Message::Register { ref identity } => {
                w.write_identity(identity).expect("identity validated at construction");
            }
            Message::UsersListReq { offset } => {
                w.write_u32(offset);
            }
            Message::UsersList { ref identities } => {
                for id in identities {
                    w.write_identity(id).expect("identity validated at construction");
                }
            }
            Message::Challenge { ref opponent } => {
                w.write_identity(opponent).expect("identity validated at construction");
            }
            Message::ChallengeFwd { ref challenger } => {
                w.write_identity(challenger).expect("identity validated at construction");
            }
            Message::ChallengeResp {
                accept,
                listen_port,
                ref challenger_id,
            } => {
                w.write_bool(accept);
                w.write_u16(listen_port);
                w.write_identity(challenger_id).expect("identity validated at construction");
            }
            Message::GameStart {
                ref opponent,
                ref addr,
                ref opponent_cert,
            } => {
                w.write_identity(opponent).expect("identity validated at construction");
                w.write_socket_addr_v4(addr);
                w.write_opaque(opponent_cert);
            }
            Message::GameCancel { ref opponent } => {
                w.write_identity(opponent).expect("identity validated at construction");
            }
            Message::GameEnd => {}
            Message::StartGamePeer => {}
            Message::Move { column } => {
                w.write_u8(column);
            }
        }
        w.into_vec()
    }

    /// Decodes a message from its tag byte plus payload.
    pub fn from_bytes(raw: &[u8]) -> Result<Message, CodecError> {
        let mut r = Reader::new(raw);
        let t = r.read_u8()?;
        let msg = match t {
            tag::SECURE_MESSAGE => {
                let rest = r.rest();
                if rest.len() < 16 {
                    return Err(CodecError::InvalidLength);
                }
                let split = rest.len() - 16;
                let mut tag = [0u8; 16];
                tag.copy_from_slice(&rest[split..]);
                Message::SecureMessage {
                    ciphertext: rest[..split].to_vec(),
                    tag,
                }
            }
            tag::CLIENT_HELLO => Message::ClientHello {
                client_nonce: r.read_u32()?,
                my_id: r.read_identity()?,
                peer_id: r.read_identity()?,
                ephemeral_public_key: r.read_fixed_public_key()?,
            },
            tag::SERVER_HELLO => Message::ServerHello {
                server_nonce: r.read_u32()?,
                my_id: r.read_identity()?,
                peer_id: r.read_identity()?,
                signature: r.read_opaque()?,
                ephemeral_public_key: r.read_fixed_public_key()?,
            },
            tag::CLIENT_VERIFY => Message::ClientVerify {
                signature: r.read_opaque()?,
            },
            tag::CERT_REQ => Message::CertReq,
            tag::CERTIFICATE => Message::Certificate { cert: r.read_opaque()? },
            tag::REGISTER => Message::Register {
                identity: r.read_identity()?,
            },
            tag::USERS_LIST_REQ => Message::UsersListReq { offset: r.read_u32()? },
            tag::USERS_LIST => {
                let mut identities = Vec::new();
                while r.remaining() >= IDENTITY_FIELD_SIZE {
                    identities.push(r.read_identity()?);
                }
                Message::UsersList { identities }
            }
            tag::CHALLENGE => Message::Challenge {
                opponent: r.read_identity()?,
            },
            tag::CHALLENGE_FWD => Message::ChallengeFwd {
                challenger: r.read_identity()?,
            },
            tag::CHALLENGE_RESP => Message::ChallengeResp {
                accept: r.read_bool()?,
                listen_port: r.read_u16()?,
                challenger_id: r.read_identity()?,
            },
            tag::GAME_START => Message::GameStart {
                opponent: r.read_identity()?,
                addr: r.read_socket_addr_v4()?,
                opponent_cert: r.read_opaque()?,
            },
            tag::GAME_CANCEL => Message::GameCancel {
                opponent: r.read_identity()?,
            },
            tag::GAME_END => Message::GameEnd,
            tag::START_GAME_PEER => Message::StartGamePeer,
            tag::MOVE => Message::Move { column: r.read_u8()? },
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let bytes = msg.to_bytes();
        let decoded = Message::from_bytes(&bytes).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_client_hello() {
        roundtrip(Message::ClientHello {
            client_nonce: 0xdeadbeef,
            my_id: "alice".to_string(),
            peer_id: "server".to_string(),
            ephemeral_public_key: [7u8; P256_PUBLIC_KEY_SIZE],
        });
    }

    #[test]
    fn roundtrip_server_hello() {
        roundtrip(Message::ServerHello {
            server_nonce: 42,
            my_id: "server".to_string(),
            peer_id: "alice".to_string(),
            signature: vec![1, 2, 3, 4, 5],
            ephemeral_public_key: [9u8; P256_PUBLIC_KEY_SIZE],
        });
    }

    #[test]
    fn roundtrip_secure_message() {
        roundtrip(Message::SecureMessage {
            ciphertext: vec![0xaa; 20],
            tag: [0x11; 16],
        });
    }

    #[test]
    fn roundtrip_users_list() {
        roundtrip(Message::UsersList {
            identities: vec!["a01".to_string(), "bob".to_string(), "0123456789abcdef".to_string()],
        });
    }

    #[test]
    fn roundtrip_challenge_resp() {
        roundtrip(Message::ChallengeResp {
            accept: true,
            listen_port: 50000,
            challenger_id: "alice".to_string(),
        });
    }

    #[test]
    fn roundtrip_game_start() {
        roundtrip(Message::GameStart {
            opponent: "bob".to_string(),
            addr: "10.0.0.1:50000".parse().unwrap(),
            opponent_cert: vec![0xde, 0xad, 0xbe, 0xef],
        });
    }

    #[test]
    fn roundtrip_move() {
        roundtrip(Message::Move { column: 5 });
    }

    #[test]
    fn roundtrip_empty_messages() {
        roundtrip(Message::CertReq);
        roundtrip(Message::GameEnd);
        roundtrip(Message::StartGamePeer);
    }

    #[test]
    fn identity_minimum_and_maximum_size() {
        roundtrip(Message::Register { identity: "ab".to_string() });
        roundtrip(Message::Register {
            identity: "0123456789abcdef".to_string(),
        });
    }

    #[test]
    fn identity_over_max_length_is_rejected() {
        let mut w = Writer::new();
        let err = w.write_identity("this-identity-is-way-too-long");
        assert!(err.is_err());
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let err = Message::from_bytes(&[0xff]).unwrap_err();
        match err {
            CodecError::UnknownTag(0xff) => {}
            _ => panic!("expected UnknownTag"),
        }
    }

    #[test]
    fn truncated_message_fails_closed() {
        let full = Message::Register {
            identity: "alice".to_string(),
        }
        .to_bytes();
        let err = Message::from_bytes(&full[..full.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::BufferTooSmall));
    }
}
