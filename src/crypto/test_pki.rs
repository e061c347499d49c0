// crypto/test_pki.rs - minimal DER certificate/CRL builder for tests
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

//! Builds just enough DER-encoded X.509v3 certificates and CRLs, signed
//! with real P-256 keys, to exercise `crypto::cert` and `directory`
//! against something other than garbage bytes. No certificate-authoring
//! crate appears anywhere in this workspace's dependency graph, so this
//! is hand-rolled ASN.1 rather than an invented dependency.

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand_core::OsRng;

const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];
const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];
const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else {
        let mut bytes = Vec::new();
        let mut n = len;
        while n > 0 {
            bytes.insert(0, (n & 0xff) as u8);
            n >>= 8;
        }
        let mut out = vec![0x80 | bytes.len() as u8];
        out.extend(bytes);
        out
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_len(content.len()));
    out.extend_from_slice(content);
    out
}

fn sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    let content: Vec<u8> = parts.concat();
    tlv(0x30, &content)
}

fn der_oid(arcs: &[u64]) -> Vec<u8> {
    let mut content = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        if arc == 0 {
            content.push(0);
            continue;
        }
        let mut bytes = Vec::new();
        let mut n = arc;
        while n > 0 {
            bytes.insert(0, (n & 0x7f) as u8);
            n >>= 7;
        }
        let len = bytes.len();
        for b in &mut bytes[..len - 1] {
            *b |= 0x80;
        }
        content.extend(bytes);
    }
    tlv(0x06, &content)
}

fn der_integer_unsigned(bytes: &[u8]) -> Vec<u8> {
    let mut trimmed = bytes;
    while trimmed.len() > 1 && trimmed[0] == 0 {
        trimmed = &trimmed[1..];
    }
    let mut content = Vec::new();
    if trimmed[0] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(trimmed);
    tlv(0x02, &content)
}

fn der_small_integer(v: u64) -> Vec<u8> {
    der_integer_unsigned(&v.to_be_bytes())
}

fn der_bit_string(bytes: &[u8]) -> Vec<u8> {
    let mut content = vec![0u8];
    content.extend_from_slice(bytes);
    tlv(0x03, &content)
}

fn der_utf8_string(s: &str) -> Vec<u8> {
    tlv(0x0c, s.as_bytes())
}

fn der_generalized_time(s: &str) -> Vec<u8> {
    tlv(0x18, s.as_bytes())
}

fn algorithm_identifier(oid_arcs: &[u64], params: Option<Vec<u8>>) -> Vec<u8> {
    let mut parts = vec![der_oid(oid_arcs)];
    if let Some(p) = params {
        parts.push(p);
    }
    sequence(&parts)
}

fn name_with_cn(cn: &str) -> Vec<u8> {
    let atv = sequence(&[der_oid(OID_COMMON_NAME), der_utf8_string(cn)]);
    let rdn = tlv(0x31, &atv); // SET OF
    sequence(&[rdn])
}

fn spki_p256(pubkey_sec1_uncompressed: &[u8]) -> Vec<u8> {
    let alg = algorithm_identifier(OID_EC_PUBLIC_KEY, Some(der_oid(OID_PRIME256V1)));
    sequence(&[alg, der_bit_string(pubkey_sec1_uncompressed)])
}

fn public_key_uncompressed(sk: &SigningKey) -> Vec<u8> {
    sk.verifying_key().to_encoded_point(false).as_bytes().to_vec()
}

fn random_serial() -> Vec<u8> {
    use rand_core::RngCore;
    let mut serial = [0u8; 8];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f; // keep unambiguously positive
    serial.to_vec()
}

/// A generated certificate plus the signing key backing it.
pub struct IssuedCert {
    pub der: Vec<u8>,
    pub signing_key: SigningKey,
    pub serial: Vec<u8>,
}

fn build_and_sign(
    serial: &[u8],
    issuer_cn: &str,
    subject_cn: &str,
    subject_pk: &[u8],
    signer: &SigningKey,
) -> Vec<u8> {
    let sig_alg = algorithm_identifier(OID_ECDSA_WITH_SHA256, None);
    let tbs = sequence(&[
        tlv(0xa0, &der_small_integer(2)), // version v3, [0] EXPLICIT
        der_integer_unsigned(serial),
        sig_alg.clone(),
        name_with_cn(issuer_cn),
        sequence(&[
            der_generalized_time("20200101000000Z"),
            der_generalized_time("20991231235959Z"),
        ]),
        name_with_cn(subject_cn),
        spki_p256(subject_pk),
    ]);

    let signature: Signature = signer.sign(&tbs);
    let sig_der = signature.to_der();

    sequence(&[tbs, sig_alg, der_bit_string(sig_der.as_bytes())])
}

/// Builds a self-signed CA certificate with common name `cn`.
pub fn make_ca(cn: &str) -> IssuedCert {
    let sk = SigningKey::random(&mut OsRng);
    let pk = public_key_uncompressed(&sk);
    let serial = random_serial();
    let der = build_and_sign(&serial, cn, cn, &pk, &sk);
    IssuedCert { der, signing_key: sk, serial }
}

/// Builds a leaf certificate with common name `cn`, signed by `ca`.
pub fn make_leaf(ca: &IssuedCert, issuer_cn: &str, cn: &str) -> IssuedCert {
    let leaf_sk = SigningKey::random(&mut OsRng);
    let pk = public_key_uncompressed(&leaf_sk);
    let serial = random_serial();
    let der = build_and_sign(&serial, issuer_cn, cn, &pk, &ca.signing_key);
    IssuedCert { der, signing_key: leaf_sk, serial }
}

/// Builds a CRL issued by `ca`, listing `revoked_serials`.
pub fn make_crl(ca: &IssuedCert, issuer_cn: &str, revoked_serials: &[Vec<u8>]) -> Vec<u8> {
    let sig_alg = algorithm_identifier(OID_ECDSA_WITH_SHA256, None);

    let entries: Vec<Vec<u8>> = revoked_serials
        .iter()
        .map(|serial| sequence(&[der_integer_unsigned(serial), der_generalized_time("20240601000000Z")]))
        .collect();

    let mut tbs_parts = vec![
        der_small_integer(1),
        sig_alg.clone(),
        name_with_cn(issuer_cn),
        der_generalized_time("20240101000000Z"),
        der_generalized_time("20991231235959Z"),
    ];
    if !entries.is_empty() {
        tbs_parts.push(sequence(&entries));
    }
    let tbs = sequence(&tbs_parts);

    let signature: Signature = ca.signing_key.sign(&tbs);
    let sig_der = signature.to_der();

    sequence(&[tbs, sig_alg, der_bit_string(sig_der.as_bytes())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cert;

    #[test]
    fn generated_leaf_identity_round_trips() {
        let ca = make_ca("fourlink-test-ca");
        let leaf = make_leaf(&ca, "fourlink-test-ca", "alice");
        assert_eq!(cert::identity_of(&leaf.der).unwrap(), "alice");
    }

    #[test]
    fn generated_chain_validates() {
        let ca = make_ca("fourlink-test-ca");
        let leaf = make_leaf(&ca, "fourlink-test-ca", "alice");
        let crl = make_crl(&ca, "fourlink-test-ca", &[]);
        let store = cert::TrustStore::new(ca.der.clone(), crl).unwrap();
        assert!(cert::validate(&store, &leaf.der).is_ok());
    }

    #[test]
    fn revoked_leaf_is_rejected() {
        let ca = make_ca("fourlink-test-ca");
        let leaf = make_leaf(&ca, "fourlink-test-ca", "bob");
        let crl = make_crl(&ca, "fourlink-test-ca", &[leaf.serial.clone()]);
        let store = cert::TrustStore::new(ca.der.clone(), crl).unwrap();
        assert!(cert::validate(&store, &leaf.der).is_err());
    }

    #[test]
    fn leaf_from_a_different_ca_is_rejected() {
        let ca = make_ca("fourlink-test-ca");
        let other_ca = make_ca("impostor-ca");
        let leaf = make_leaf(&other_ca, "impostor-ca", "eve");
        let crl = make_crl(&ca, "fourlink-test-ca", &[]);
        let store = cert::TrustStore::new(ca.der.clone(), crl).unwrap();
        assert!(cert::validate(&store, &leaf.der).is_err());
    }

    #[test]
    fn extracted_public_key_verifies_leaf_signatures() {
        use crate::crypto::sign;

        let ca = make_ca("fourlink-test-ca");
        let leaf = make_leaf(&ca, "fourlink-test-ca", "alice");
        let pk = cert::public_key_sec1(&leaf.der).unwrap();

        let sig = sign::sign(&leaf.signing_key.to_bytes(), b"transcript").unwrap();
        assert!(sign::verify(&pk, b"transcript", &sig));
    }
}
