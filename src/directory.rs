// directory.rs - peer certificate directory (C5)
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

//! Maps a registered identity to its long-term certificate. Loaded once
//! at startup by scanning a directory for files matching
//! `*_cert.der` (DER, not PEM, per §1's non-goal); every match is
//! validated against the CA store and CRL before it enters the map. A
//! single invalid certificate aborts startup (§4.5).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::crypto::cert::{self, TrustStore};
use crate::errors::CryptoError;

const CERT_SUFFIX: &str = "_cert.der";

/// Identity -> long-term certificate (DER), read-only after load (§5).
pub struct PeerDirectory {
    certs: HashMap<String, Vec<u8>>,
}

impl PeerDirectory {
    /// Scans `dir` for `*_cert.der` files, validating each against
    /// `store`. Returns an error on the first invalid certificate,
    /// matching spec.md's "any invalid certificate aborts startup".
    pub fn load(dir: &Path, store: &TrustStore) -> Result<PeerDirectory, CryptoError> {
        let mut certs = HashMap::new();
        let mut skipped = 0usize;

        let entries = fs::read_dir(dir).map_err(|_| CryptoError::MalformedCertificate)?;
        for entry in entries {
            let entry = entry.map_err(|_| CryptoError::MalformedCertificate)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(CERT_SUFFIX) {
                debug!("directory: skipping non-certificate file {}", name);
                skipped += 1;
                continue;
            }

            let der = fs::read(entry.path()).map_err(|_| CryptoError::MalformedCertificate)?;
            cert::validate(store, &der)?;
            let identity = cert::identity_of(&der)?;

            if certs.insert(identity.clone(), der).is_some() {
                warn!("directory: duplicate certificate for identity {}", identity);
            }
        }

        info!(
            "directory: loaded {} peer certificate(s), skipped {} non-matching file(s)",
            certs.len(),
            skipped
        );
        Ok(PeerDirectory { certs })
    }

    /// Looks up the DER certificate registered for `identity`.
    pub fn get(&self, identity: &str) -> Option<&[u8]> {
        self.certs.get(identity).map(|v| v.as_slice())
    }

    /// Whether `identity` is present in the directory.
    pub fn contains(&self, identity: &str) -> bool {
        self.certs.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_pki;
    use std::fs::File;
    use std::io::Write;

    fn write_cert(dir: &Path, name: &str, der: &[u8]) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(der).unwrap();
    }

    #[test]
    fn loads_matching_files_and_skips_others() {
        let ca = test_pki::make_ca("fourlink-test-ca");
        let alice = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");
        let bob = test_pki::make_leaf(&ca, "fourlink-test-ca", "bob");
        let crl = test_pki::make_crl(&ca, "fourlink-test-ca", &[]);
        let store = TrustStore::new(ca.der.clone(), crl).unwrap();

        let tmp = std::env::temp_dir().join(format!("fourlink-directory-test-{:x}", rand::random::<u64>()));
        fs::create_dir_all(&tmp).unwrap();
        write_cert(&tmp, "alice_cert.der", &alice.der);
        write_cert(&tmp, "bob_cert.der", &bob.der);
        write_cert(&tmp, "README.txt", b"not a certificate");

        let directory = PeerDirectory::load(&tmp, &store).unwrap();
        assert_eq!(directory.len(), 2);
        assert!(directory.contains("alice"));
        assert!(directory.contains("bob"));
        assert!(directory.get("alice").is_some());

        fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn aborts_on_invalid_certificate() {
        let ca = test_pki::make_ca("fourlink-test-ca");
        let other_ca = test_pki::make_ca("impostor-ca");
        let forged = test_pki::make_leaf(&other_ca, "impostor-ca", "eve");
        let crl = test_pki::make_crl(&ca, "fourlink-test-ca", &[]);
        let store = TrustStore::new(ca.der.clone(), crl).unwrap();

        let tmp = std::env::temp_dir().join(format!("fourlink-directory-test-{:x}", rand::random::<u64>()));
        fs::create_dir_all(&tmp).unwrap();
        write_cert(&tmp, "eve_cert.der", &forged.der);

        assert!(PeerDirectory::load(&tmp, &store).is_err());

        fs::remove_dir_all(&tmp).ok();
    }
}
