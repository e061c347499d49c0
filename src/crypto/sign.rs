// crypto/sign.rs - ECDSA P-256/SHA-256 sign and verify
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

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use crate::constants::P256_SIGNATURE_SIZE;
use crate::errors::CryptoError;

/// `Sign(sk, msg) -> sig`. `sk_bytes` is the 32-byte P-256 scalar.
pub fn sign(sk_bytes: &[u8], msg: &[u8]) -> Result<[u8; P256_SIGNATURE_SIZE], CryptoError> {
    let key = SigningKey::from_slice(sk_bytes).map_err(|_| CryptoError::SignatureInvalid)?;
    let sig: Signature = key.sign(msg);
    let mut out = [0u8; P256_SIGNATURE_SIZE];
    out.copy_from_slice(&sig.to_bytes());
    Ok(out)
}

/// `Verify(pk, msg, sig) -> bool`. `pk_bytes` is a SEC1 (compressed or
/// uncompressed) encoded public point.
pub fn verify(pk_bytes: &[u8], msg: &[u8], sig_bytes: &[u8; P256_SIGNATURE_SIZE]) -> bool {
    let key = match VerifyingKey::from_sec1_bytes(pk_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig = match Signature::from_slice(sig_bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    key.verify(msg, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey as RawSigningKey;
    use rand_core::OsRng;

    fn keypair() -> (Vec<u8>, Vec<u8>) {
        let sk = RawSigningKey::random(&mut OsRng);
        let pk = sk.verifying_key();
        (
            sk.to_bytes().to_vec(),
            pk.to_encoded_point(true).as_bytes().to_vec(),
        )
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (sk, pk) = keypair();
        let msg = b"transcript bytes";
        let sig = sign(&sk, msg).unwrap();
        assert!(verify(&pk, msg, &sig));
    }

    #[test]
    fn verify_fails_on_altered_message() {
        let (sk, pk) = keypair();
        let sig = sign(&sk, b"original").unwrap();
        assert!(!verify(&pk, b"altered!", &sig));
    }

    #[test]
    fn verify_fails_on_wrong_key() {
        let (sk, _pk) = keypair();
        let (_other_sk, other_pk) = keypair();
        let sig = sign(&sk, b"msg").unwrap();
        assert!(!verify(&other_pk, b"msg", &sig));
    }
}
