// crypto/aead.rs - AES-128-GCM authenticated encryption with associated data
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

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};

use crate::constants::{AEAD_IV_SIZE, AEAD_KEY_SIZE, AEAD_TAG_SIZE};
use crate::errors::CryptoError;

/// `AEAD(key, iv, aad, plaintext) -> (ciphertext, tag)`.
pub fn seal(
    key: &[u8; AEAD_KEY_SIZE],
    iv: &[u8; AEAD_IV_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; AEAD_TAG_SIZE]), CryptoError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let combined = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadVerifyFailed)?;
    let split = combined.len() - AEAD_TAG_SIZE;
    let mut tag = [0u8; AEAD_TAG_SIZE];
    tag.copy_from_slice(&combined[split..]);
    Ok((combined[..split].to_vec(), tag))
}

/// `AEAD^-1(key, iv, aad, ciphertext, tag) -> plaintext or FAIL`.
/// Failure is unforgeable: no plaintext is released on mismatch.
pub fn open(
    key: &[u8; AEAD_KEY_SIZE],
    iv: &[u8; AEAD_IV_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; AEAD_TAG_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let mut combined = Vec::with_capacity(ciphertext.len() + AEAD_TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::AeadVerifyFailed)
}
