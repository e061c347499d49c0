// crypto/ecdh.rs - ephemeral P-256 Diffie-Hellman key agreement
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

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePublicKey;
use p256::PublicKey;
use rand_core::OsRng;

use crate::constants::P256_PUBLIC_KEY_SIZE;
use crate::errors::CryptoError;

/// An ephemeral key pair generated fresh per handshake per side (§3).
/// The secret half zeroizes itself on drop (the `p256` crate marks
/// `EphemeralSecret` as `ZeroizeOnDrop`).
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: [u8; P256_PUBLIC_KEY_SIZE],
}

impl EphemeralKeyPair {
    /// `ECDH.keygen() -> (private, public)`.
    pub fn generate() -> EphemeralKeyPair {
        let secret = EphemeralSecret::random(&mut OsRng);
        let encoded = secret.public_key().to_encoded_point(true);
        let mut public = [0u8; P256_PUBLIC_KEY_SIZE];
        public.copy_from_slice(encoded.as_bytes());
        EphemeralKeyPair { secret, public }
    }

    /// The SEC1-compressed public half, as carried on the wire.
    pub fn public_key_bytes(&self) -> [u8; P256_PUBLIC_KEY_SIZE] {
        self.public
    }

    /// `ECDH(private, peer_public) -> shared_secret`.
    pub fn agree(&self, peer_public: &[u8; P256_PUBLIC_KEY_SIZE]) -> Result<[u8; 32], CryptoError> {
        let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::KeyAgreementFailed)?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// Encodes a SEC1 ephemeral public key as a DER `SubjectPublicKeyInfo`,
/// the form the secure channel's handshake transcript signs over
/// (distinct from the fixed-width SEC1 encoding used on the wire).
pub fn der_spki(pubkey: &[u8; P256_PUBLIC_KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    let key = PublicKey::from_sec1_bytes(pubkey).map_err(|_| CryptoError::KeyAgreementFailed)?;
    key.to_public_key_der()
        .map(|doc| doc.into_vec())
        .map_err(|_| CryptoError::KeyAgreementFailed)
}
