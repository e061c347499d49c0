// channel.rs - secure channel: handshake state machine and record layer (C4)
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

//! Drives the mutually authenticated, forward-secret handshake
//! (CLIENT_HELLO / SERVER_HELLO / CLIENT_VERIFY) to a pair of
//! per-direction AEAD session states, then encrypts/decrypts
//! SECURE_MESSAGE records against a strictly monotonic sequence
//! counter (spec §4.4). The channel never touches a socket directly;
//! callers drive it with `Message` values produced and consumed by
//! the framing transport and wire codec.

use zeroize::Zeroize;

use crate::codec::Message;
use crate::constants::{AEAD_IV_SIZE, AEAD_KEY_SIZE, IDENTITY_FIELD_SIZE, P256_PUBLIC_KEY_SIZE};
use crate::crypto::{aead, ecdh, hkdf, sign};
use crate::errors::ChannelError;
use crate::framing;

/// Which side of the handshake this process is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"client",
            Role::Responder => b"server",
        }
    }

    fn peer_label(self) -> &'static [u8] {
        match self {
            Role::Initiator => b"server",
            Role::Responder => b"client",
        }
    }
}

fn identity_field(id: &str) -> [u8; IDENTITY_FIELD_SIZE] {
    let mut out = [0u8; IDENTITY_FIELD_SIZE];
    let bytes = id.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// Builds the canonical transcript bytes both sides sign: identities,
/// nonces, and DER-encoded ephemeral public keys, with the initiator
/// always first regardless of which side is computing it (spec §4.4).
fn transcript(
    initiator_id: &str,
    responder_id: &str,
    client_nonce: u32,
    server_nonce: u32,
    initiator_eph_pk: &[u8; P256_PUBLIC_KEY_SIZE],
    responder_eph_pk: &[u8; P256_PUBLIC_KEY_SIZE],
) -> Result<Vec<u8>, ChannelError> {
    let mut out = Vec::new();
    out.extend_from_slice(&identity_field(initiator_id));
    out.extend_from_slice(&identity_field(responder_id));
    out.extend_from_slice(&client_nonce.to_be_bytes());
    out.extend_from_slice(&server_nonce.to_be_bytes());
    out.extend_from_slice(&ecdh::der_spki(initiator_eph_pk)?);
    out.extend_from_slice(&ecdh::der_spki(responder_eph_pk)?);
    Ok(out)
}

/// Derives the four key-schedule outputs from a shared secret and
/// returns them as (own send key, own recv key, own send IV, own recv IV).
struct KeySchedule {
    send_key: [u8; AEAD_KEY_SIZE],
    recv_key: [u8; AEAD_KEY_SIZE],
    send_iv: [u8; AEAD_IV_SIZE],
    recv_iv: [u8; AEAD_IV_SIZE],
}

impl KeySchedule {
    fn derive(shared: &[u8], client_nonce: u32, server_nonce: u32, role: Role) -> Result<KeySchedule, ChannelError> {
        let mut label = |prefix: &[u8], who: &[u8]| -> Result<Vec<u8>, ChannelError> {
            let mut l = Vec::with_capacity(prefix.len() + who.len());
            l.extend_from_slice(prefix);
            l.extend_from_slice(who);
            Ok(l)
        };

        let own = role.label();
        let peer = role.peer_label();

        let send_key_label = label(b"key_", own)?;
        let recv_key_label = label(b"key_", peer)?;
        let send_iv_label = label(b"iv__", own)?;
        let recv_iv_label = label(b"iv__", peer)?;

        let send_key = hkdf::derive(shared, client_nonce, server_nonce, &send_key_label, AEAD_KEY_SIZE)?;
        let recv_key = hkdf::derive(shared, client_nonce, server_nonce, &recv_key_label, AEAD_KEY_SIZE)?;
        let send_iv = hkdf::derive(shared, client_nonce, server_nonce, &send_iv_label, AEAD_IV_SIZE)?;
        let recv_iv = hkdf::derive(shared, client_nonce, server_nonce, &recv_iv_label, AEAD_IV_SIZE)?;

        let mut out = KeySchedule {
            send_key: [0u8; AEAD_KEY_SIZE],
            recv_key: [0u8; AEAD_KEY_SIZE],
            send_iv: [0u8; AEAD_IV_SIZE],
            recv_iv: [0u8; AEAD_IV_SIZE],
        };
        out.send_key.copy_from_slice(&send_key);
        out.recv_key.copy_from_slice(&recv_key);
        out.send_iv.copy_from_slice(&send_iv);
        out.recv_iv.copy_from_slice(&recv_iv);
        Ok(out)
    }
}

/// Handshake state carried across the three messages of §4.4.
pub struct Handshake {
    role: Role,
    my_id: String,
    peer_id: String,
    signing_key: Vec<u8>,
    eph: ecdh::EphemeralKeyPair,
    client_nonce: u32,
    server_nonce: u32,
    peer_eph_pk: Option<[u8; P256_PUBLIC_KEY_SIZE]>,
    step: Step,
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Start,
    SentClientHello,
    SentServerHello,
    Done,
}

impl Handshake {
    /// Begins the initiator side: builds CLIENT_HELLO.
    pub fn start_initiator(my_id: &str, peer_id: &str, signing_key: &[u8], client_nonce: u32) -> (Handshake, Message) {
        let eph = ecdh::EphemeralKeyPair::generate();
        let msg = Message::ClientHello {
            client_nonce,
            my_id: my_id.to_string(),
            peer_id: peer_id.to_string(),
            ephemeral_public_key: eph.public_key_bytes(),
        };
        let hs = Handshake {
            role: Role::Initiator,
            my_id: my_id.to_string(),
            peer_id: peer_id.to_string(),
            signing_key: signing_key.to_vec(),
            eph,
            client_nonce,
            server_nonce: 0,
            peer_eph_pk: None,
            step: Step::SentClientHello,
        };
        (hs, msg)
    }

    /// The identity the peer claimed in CLIENT_HELLO. Empty until
    /// `on_client_hello` has run (responder side only).
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Begins the responder side, awaiting CLIENT_HELLO.
    pub fn start_responder(my_id: &str, signing_key: &[u8]) -> Handshake {
        Handshake {
            role: Role::Responder,
            my_id: my_id.to_string(),
            peer_id: String::new(),
            signing_key: signing_key.to_vec(),
            eph: ecdh::EphemeralKeyPair::generate(),
            client_nonce: 0,
            server_nonce: 0,
            peer_eph_pk: None,
            step: Step::Start,
        }
    }

    /// Responder: handles CLIENT_HELLO, returns SERVER_HELLO and the
    /// shared secret (kept internally for the final key derivation).
    pub fn on_client_hello(&mut self, msg: &Message, server_nonce: u32) -> Result<Message, ChannelError> {
        if self.step != Step::Start {
            return Err(ChannelError::DuplicateHandshakeMessage);
        }
        let (client_nonce, my_id, eph_pk) = match msg {
            Message::ClientHello {
                client_nonce,
                my_id,
                ephemeral_public_key,
                ..
            } => (*client_nonce, my_id.clone(), *ephemeral_public_key),
            _ => return Err(ChannelError::UnexpectedMessage),
        };

        self.peer_id = my_id;
        self.client_nonce = client_nonce;
        self.server_nonce = server_nonce;
        self.peer_eph_pk = Some(eph_pk);

        let sig_transcript = transcript(
            &self.peer_id,
            &self.my_id,
            self.client_nonce,
            self.server_nonce,
            &eph_pk,
            &self.eph.public_key_bytes(),
        )?;
        let sig = sign::sign(&self.signing_key, &sig_transcript)?;

        self.step = Step::SentServerHello;

        Ok(Message::ServerHello {
            server_nonce,
            my_id: self.my_id.clone(),
            peer_id: self.peer_id.clone(),
            signature: sig.to_vec(),
            ephemeral_public_key: self.eph.public_key_bytes(),
        })
    }

    /// Initiator: handles SERVER_HELLO, verifies the responder's
    /// signature, returns CLIENT_VERIFY.
    pub fn on_server_hello(&mut self, msg: &Message, responder_pubkey: &[u8]) -> Result<Message, ChannelError> {
        if self.step != Step::SentClientHello {
            return Err(ChannelError::DuplicateHandshakeMessage);
        }
        let (server_nonce, my_id, signature, eph_pk) = match msg {
            Message::ServerHello {
                server_nonce,
                my_id,
                signature,
                ephemeral_public_key,
                ..
            } => (*server_nonce, my_id.clone(), signature.clone(), *ephemeral_public_key),
            _ => return Err(ChannelError::UnexpectedMessage),
        };
        if my_id != self.peer_id {
            return Err(ChannelError::UnexpectedMessage);
        }

        self.server_nonce = server_nonce;
        self.peer_eph_pk = Some(eph_pk);

        let sig_transcript = transcript(
            &self.my_id,
            &self.peer_id,
            self.client_nonce,
            self.server_nonce,
            &self.eph.public_key_bytes(),
            &eph_pk,
        )?;
        if signature.len() != crate::constants::P256_SIGNATURE_SIZE {
            return Err(ChannelError::Crypto(crate::errors::CryptoError::SignatureInvalid));
        }
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(&signature);
        if !sign::verify(responder_pubkey, &sig_transcript, &sig_arr) {
            return Err(ChannelError::Crypto(crate::errors::CryptoError::SignatureInvalid));
        }

        let my_transcript = transcript(
            &self.my_id,
            &self.peer_id,
            self.client_nonce,
            self.server_nonce,
            &self.eph.public_key_bytes(),
            &eph_pk,
        )?;
        let my_sig = sign::sign(&self.signing_key, &my_transcript)?;

        self.step = Step::Done;
        Ok(Message::ClientVerify { signature: my_sig.to_vec() })
    }

    /// Responder: handles CLIENT_VERIFY, finalizes the channel.
    pub fn on_client_verify(mut self, msg: &Message, initiator_pubkey: &[u8]) -> Result<SecureChannel, ChannelError> {
        if self.step != Step::SentServerHello {
            return Err(ChannelError::DuplicateHandshakeMessage);
        }
        let signature = match msg {
            Message::ClientVerify { signature } => signature.clone(),
            _ => return Err(ChannelError::UnexpectedMessage),
        };
        let peer_eph_pk = self.peer_eph_pk.ok_or(ChannelError::UnexpectedMessage)?;

        let sig_transcript = transcript(
            &self.peer_id,
            &self.my_id,
            self.client_nonce,
            self.server_nonce,
            &peer_eph_pk,
            &self.eph.public_key_bytes(),
        )?;
        if signature.len() != crate::constants::P256_SIGNATURE_SIZE {
            return Err(ChannelError::Crypto(crate::errors::CryptoError::SignatureInvalid));
        }
        let mut sig_arr = [0u8; 64];
        sig_arr.copy_from_slice(&signature);
        if !sign::verify(initiator_pubkey, &sig_transcript, &sig_arr) {
            return Err(ChannelError::Crypto(crate::errors::CryptoError::SignatureInvalid));
        }

        self.step = Step::Done;
        self.finish(peer_eph_pk)
    }

    /// Initiator: after sending CLIENT_VERIFY its own side is already
    /// authenticated (it verified the responder's signature in
    /// `on_server_hello`); call this to finalize.
    pub fn finish_initiator(self) -> Result<SecureChannel, ChannelError> {
        let peer_eph_pk = self.peer_eph_pk.ok_or(ChannelError::UnexpectedMessage)?;
        self.finish(peer_eph_pk)
    }

    fn finish(self, peer_eph_pk: [u8; P256_PUBLIC_KEY_SIZE]) -> Result<SecureChannel, ChannelError> {
        let shared = self.eph.agree(&peer_eph_pk)?;
        let schedule = KeySchedule::derive(&shared, self.client_nonce, self.server_nonce, self.role)?;
        Ok(SecureChannel {
            send_key: schedule.send_key,
            recv_key: schedule.recv_key,
            send_iv: schedule.send_iv,
            recv_iv: schedule.recv_iv,
            send_seq: 0,
            recv_seq: 0,
        })
    }
}

/// Computes the per-record IV: `static_iv XOR (seq_le ++ 0-pad)` (§4.4).
fn record_iv(static_iv: &[u8; AEAD_IV_SIZE], seq: u64) -> [u8; AEAD_IV_SIZE] {
    let mut iv = *static_iv;
    let seq_le = seq.to_le_bytes();
    for i in 0..seq_le.len() {
        iv[i] ^= seq_le[i];
    }
    iv
}

/// An established secure channel: per-direction AEAD session state and
/// sequence counters, ready to encrypt/decrypt SECURE_MESSAGE records.
pub struct SecureChannel {
    send_key: [u8; AEAD_KEY_SIZE],
    recv_key: [u8; AEAD_KEY_SIZE],
    send_iv: [u8; AEAD_IV_SIZE],
    recv_iv: [u8; AEAD_IV_SIZE],
    send_seq: u64,
    recv_seq: u64,
}

impl SecureChannel {
    /// Encrypts `plaintext` into a `SecureMessage`. `frame_len` is the
    /// on-wire frame length (length prefix included) this record will
    /// occupy, computed by the caller via `framing::frame_total_len`
    /// once the tag byte plus ciphertext plus tag length is known.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Message, ChannelError> {
        if self.send_seq == u64::MAX {
            return Err(ChannelError::SequenceExhausted);
        }
        // tag(1) + ciphertext(len(plaintext)) + auth tag(16)
        let frame_len = framing::frame_total_len(1 + plaintext.len() + 16)
            .map_err(|_| ChannelError::Framing(crate::errors::FramingError::FrameTooLarge(plaintext.len())))?;
        let aad = [
            (frame_len >> 8) as u8,
            (frame_len & 0xff) as u8,
            crate::constants::SECURE_MESSAGE_TAG,
        ];
        let iv = record_iv(&self.send_iv, self.send_seq);
        let (ciphertext, tag) = aead::seal(&self.send_key, &iv, &aad, plaintext)?;
        self.send_seq += 1;
        Ok(Message::SecureMessage { ciphertext, tag })
    }

    /// Decrypts a received `SecureMessage`. `frame_len` is the on-wire
    /// frame length the framing transport actually observed for this
    /// record, which must match what the sender bound into the AAD.
    pub fn decrypt(&mut self, msg: &Message, frame_len: u16) -> Result<Vec<u8>, ChannelError> {
        let (ciphertext, tag) = match msg {
            Message::SecureMessage { ciphertext, tag } => (ciphertext, tag),
            _ => return Err(ChannelError::UnexpectedMessage),
        };
        if self.recv_seq == u64::MAX {
            return Err(ChannelError::SequenceExhausted);
        }
        let aad = [
            (frame_len >> 8) as u8,
            (frame_len & 0xff) as u8,
            crate::constants::SECURE_MESSAGE_TAG,
        ];
        let iv = record_iv(&self.recv_iv, self.recv_seq);
        let plaintext = aead::open(&self.recv_key, &iv, &aad, ciphertext, tag)?;
        self.recv_seq += 1;
        Ok(plaintext)
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
        self.send_iv.zeroize();
        self.recv_iv.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use rand_core::OsRng;

    fn keypair() -> (Vec<u8>, Vec<u8>) {
        let sk = SigningKey::random(&mut OsRng);
        let pk = sk.verifying_key();
        (sk.to_bytes().to_vec(), pk.to_encoded_point(true).as_bytes().to_vec())
    }

    fn full_handshake() -> (SecureChannel, SecureChannel) {
        let (client_sk, client_pk) = keypair();
        let (server_sk, server_pk) = keypair();

        let (mut client_hs, client_hello) = Handshake::start_initiator("alice", "bob", &client_sk, 111);
        let mut server_hs = Handshake::start_responder("bob", &server_sk);

        let server_hello = server_hs.on_client_hello(&client_hello, 222).unwrap();
        let client_verify = client_hs.on_server_hello(&server_hello, &server_pk).unwrap();
        let server_channel = server_hs.on_client_verify(&client_verify, &client_pk).unwrap();
        let client_channel = client_hs.finish_initiator().unwrap();

        (client_channel, server_channel)
    }

    #[test]
    fn handshake_produces_mirrored_keys() {
        let (mut client, mut server) = full_handshake();
        let msg = client.encrypt(b"hello").unwrap();
        let frame_len = framing::frame_total_len(match &msg {
            Message::SecureMessage { ciphertext, .. } => 1 + ciphertext.len() + 16,
            _ => unreachable!(),
        })
        .unwrap();
        let plaintext = server.decrypt(&msg, frame_len).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn sequence_counters_advance_independently_per_direction() {
        let (mut client, mut server) = full_handshake();
        for i in 0..3u8 {
            let msg = client.encrypt(&[i]).unwrap();
            let frame_len = framing::frame_total_len(match &msg {
                Message::SecureMessage { ciphertext, .. } => 1 + ciphertext.len() + 16,
                _ => unreachable!(),
            })
            .unwrap();
            let plaintext = server.decrypt(&msg, frame_len).unwrap();
            assert_eq!(plaintext, vec![i]);
        }
        assert_eq!(client.send_seq, 3);
        assert_eq!(server.recv_seq, 3);
    }

    #[test]
    fn replayed_record_fails_on_redecrypt() {
        let (mut client, mut server) = full_handshake();
        let msg = client.encrypt(b"move").unwrap();
        let frame_len = framing::frame_total_len(match &msg {
            Message::SecureMessage { ciphertext, .. } => 1 + ciphertext.len() + 16,
            _ => unreachable!(),
        })
        .unwrap();
        server.decrypt(&msg, frame_len).unwrap();
        // Replaying the exact same record: server's recv_seq already
        // advanced, so the expected IV no longer matches.
        assert!(server.decrypt(&msg, frame_len).is_err());
    }

    #[test]
    fn tampered_aad_frame_len_is_rejected() {
        let (mut client, mut server) = full_handshake();
        let msg = client.encrypt(b"move").unwrap();
        assert!(server.decrypt(&msg, 9999).is_err());
    }

    #[test]
    fn wrong_signature_key_fails_handshake() {
        let (client_sk, _client_pk) = keypair();
        let (server_sk, _server_pk) = keypair();
        let (_unrelated_sk, wrong_pk) = keypair();

        let (mut client_hs, client_hello) = Handshake::start_initiator("alice", "bob", &client_sk, 1);
        let mut server_hs = Handshake::start_responder("bob", &server_sk);
        let server_hello = server_hs.on_client_hello(&client_hello, 2).unwrap();

        assert!(client_hs.on_server_hello(&server_hello, &wrong_pk).is_err());
    }

    #[test]
    fn duplicate_client_hello_is_rejected() {
        let (client_sk, _client_pk) = keypair();
        let (server_sk, _server_pk) = keypair();
        let (_, client_hello) = Handshake::start_initiator("alice", "bob", &client_sk, 1);
        let mut server_hs = Handshake::start_responder("bob", &server_sk);
        server_hs.on_client_hello(&client_hello, 2).unwrap();
        assert!(server_hs.on_client_hello(&client_hello, 2).is_err());
    }
}
