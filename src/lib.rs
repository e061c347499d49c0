// lib.rs - mutually authenticated, forward-secret matchmaking core
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

//! Wire codec, framing transport, crypto primitives, handshake and
//! record layer, peer certificate directory, user registry, and
//! matchmaking state machine for a rendezvous server that pairs two
//! players for a game of four-in-a-row and hands them off to play
//! directly. See each module for its piece of the design.

pub mod channel;
pub mod codec;
pub mod constants;
pub mod crypto;
pub mod directory;
pub mod errors;
pub mod framing;
pub mod matchmaking;
pub mod registry;
pub mod server;
