// constants.rs - constants for the matchmaking wire protocol
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

/// Maximum number of bytes in an identity, not counting the NUL pad.
pub const MAX_USERNAME_LENGTH: usize = 16;
/// Minimum number of bytes a registered identity must contain.
pub const MIN_USERNAME_LENGTH: usize = 2;
/// On-wire width of an identity field (NUL-padded).
pub const IDENTITY_FIELD_SIZE: usize = MAX_USERNAME_LENGTH + 1;

/// Maximum size of one frame, length prefix included.
pub const MAX_FRAME_SIZE: usize = 8192;
/// Size of the frame length prefix.
pub const FRAME_LEN_SIZE: usize = 2;
/// Smallest legal frame: the length prefix plus a one-byte tag.
pub const MIN_FRAME_SIZE: usize = FRAME_LEN_SIZE + 1;

/// AEAD key size in bytes (128 bits).
pub const AEAD_KEY_SIZE: usize = 16;
/// AEAD static IV size in bytes (96 bits).
pub const AEAD_IV_SIZE: usize = 12;
/// AEAD authentication tag size in bytes (128 bits).
pub const AEAD_TAG_SIZE: usize = 16;

/// Compressed SEC1 encoding size of a P-256 public key.
pub const P256_PUBLIC_KEY_SIZE: usize = 33;
/// ECDSA P-256/SHA-256 fixed-size signature (r || s).
pub const P256_SIGNATURE_SIZE: usize = 64;

/// The tag byte used for `SECURE_MESSAGE`, fixed for AAD determinism
/// (spec Open Question 4).
pub const SECURE_MESSAGE_TAG: u8 = 0x01;

/// Bound on the server's per-connection user table.
pub const MAX_USERS: usize = 4096;
/// Bound on the dispatcher's work queue (spec section 3).
pub const MAX_QUEUE_DEPTH: usize = 1000;
/// Batch size returned by a single `USERS_LIST` response.
pub const USERS_LIST_PAGE_SIZE: usize = 10;
/// Default size of the server's worker pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Exit code: clean exit.
pub const EXIT_OK: i32 = 0;
/// Exit code: fatal configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code: connection error.
pub const EXIT_CONNECTION: i32 = 2;
/// Exit code: generic internal error.
pub const EXIT_GENERIC: i32 = 3;
/// Exit code: unrecoverable fatal error.
pub const EXIT_FATAL: i32 = 4;
