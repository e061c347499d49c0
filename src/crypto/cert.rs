// crypto/cert.rs - X.509 certificate and CRL validation against a CA store
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

//! `ValidateCert(store, cert) -> bool`. Succeeds iff the certificate
//! chains to the CA in the store, has not expired, and is not on the
//! CRL. No chain longer than CA -> leaf is supported (spec non-goal).

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::{FromDer, X509CertificateParser};
use x509_parser::revocation_list::CertificateRevocationList;

use crate::errors::CryptoError;

/// A CA certificate plus a certificate revocation list, read once at
/// startup and treated as read-only thereafter (spec §5).
#[derive(Clone)]
pub struct TrustStore {
    ca_der: Vec<u8>,
    crl_der: Vec<u8>,
}

impl TrustStore {
    pub fn new(ca_der: Vec<u8>, crl_der: Vec<u8>) -> Result<TrustStore, CryptoError> {
        // Fail fast if either blob doesn't even parse.
        X509Certificate::from_der(&ca_der).map_err(|_| CryptoError::MalformedCertificate)?;
        CertificateRevocationList::from_der(&crl_der).map_err(|_| CryptoError::MalformedCertificate)?;
        Ok(TrustStore { ca_der, crl_der })
    }

    fn ca_cert(&self) -> X509Certificate {
        X509Certificate::from_der(&self.ca_der).expect("validated in new()").1
    }

    fn crl(&self) -> CertificateRevocationList {
        CertificateRevocationList::from_der(&self.crl_der).expect("validated in new()").1
    }

    /// The CA's own common name, used for logging.
    pub fn ca_common_name(&self) -> Option<String> {
        common_name(&self.ca_cert())
    }
}

/// Parses `der` and returns the common-name identity extracted from
/// its subject, without performing trust validation.
pub fn identity_of(der: &[u8]) -> Result<String, CryptoError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| CryptoError::MalformedCertificate)?;
    common_name(&cert).ok_or(CryptoError::MalformedCertificate)
}

/// Extracts the raw SEC1 public key point from `der`'s subject public
/// key info, for use with `crypto::sign::verify`.
pub fn public_key_sec1(der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| CryptoError::MalformedCertificate)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

fn common_name(cert: &X509Certificate) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}

/// Validates `cert_der` against `store`: issued by the CA, within its
/// validity window, and not revoked.
pub fn validate(store: &TrustStore, cert_der: &[u8]) -> Result<(), CryptoError> {
    let (_, cert) = X509Certificate::from_der(cert_der).map_err(|_| CryptoError::MalformedCertificate)?;
    let ca = store.ca_cert();

    if cert.issuer() != ca.subject() {
        return Err(CryptoError::UntrustedCertificate);
    }
    cert.verify_signature(Some(ca.public_key()))
        .map_err(|_| CryptoError::UntrustedCertificate)?;

    if !cert.validity().is_valid() {
        return Err(CryptoError::CertificateExpired);
    }

    let crl = store.crl();
    let revoked = crl
        .iter_revoked_certificates()
        .any(|entry| entry.raw_serial() == cert.raw_serial());
    if revoked {
        return Err(CryptoError::CertificateRevoked);
    }

    Ok(())
}

// A standalone parser kept around for callers that need streaming
// parse behavior (directory scans of many certificate files).
pub fn parser() -> X509CertificateParser {
    X509CertificateParser::new()
}

#[cfg(test)]
mod tests {
    // Chain-building tests (self-signed CA, leaf signed by the CA, CRL
    // listing a revoked serial) live in crypto::test_pki's own test
    // module, which constructs DER certificates at test time.
    use super::*;

    #[test]
    fn malformed_der_is_rejected() {
        assert!(identity_of(&[0u8; 4]).is_err());
    }
}
