// crypto/mod.rs - cryptographic primitive contracts (C3)
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

//! The core treats these as opaque contracts (spec §4.3): AEAD,
//! ECDH key agreement, HKDF, signatures, and certificate/CRL
//! validation. Each sub-module wraps exactly one RustCrypto crate so
//! the rest of the codebase never touches a crate's API directly.

pub mod aead;
pub mod cert;
pub mod ecdh;
pub mod hkdf;
pub mod sign;

#[cfg(any(test, feature = "test-support"))]
pub mod test_pki;
