// bin/server.rs - fourlink matchmaking server entry point
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

//! Positional arguments only, no CLI-parsing crate (spec §6): listen
//! port, own certificate, own private key, CA certificate, CRL,
//! directory of peer certificates. Certificate/CRL/key files are read
//! as raw DER; PEM conversion is left to whoever prepares them.

use std::net::SocketAddr;
use std::path::Path;
use std::process;

use log::{error, info};

use fourlink::constants::{DEFAULT_WORKER_COUNT, EXIT_CONFIG, EXIT_FATAL};
use fourlink::crypto::cert::{self, TrustStore};
use fourlink::directory::PeerDirectory;
use fourlink::registry::Registry;
use fourlink::server::Dispatcher;

fn usage(argv0: &str) -> ! {
    eprintln!(
        "usage: {} <port> <own_cert.der> <own_key> <ca_cert.der> <crl.der> <peer_cert_dir>",
        argv0
    );
    process::exit(EXIT_CONFIG);
}

fn read_file(path: &str, what: &str) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("failed to read {} at {}: {}", what, path, e);
            process::exit(EXIT_CONFIG);
        }
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 7 {
        usage(&args[0]);
    }

    let port: u16 = match args[1].parse() {
        Ok(p) => p,
        Err(_) => {
            eprintln!("invalid port: {}", args[1]);
            process::exit(EXIT_CONFIG);
        }
    };

    let own_cert_der = read_file(&args[2], "own certificate");
    let signing_key = read_file(&args[3], "own private key");
    let ca_cert_der = read_file(&args[4], "CA certificate");
    let crl_der = read_file(&args[5], "CRL");
    let peer_cert_dir = Path::new(&args[6]);

    let store = match TrustStore::new(ca_cert_der, crl_der) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("invalid CA certificate or CRL: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    let directory = match PeerDirectory::load(peer_cert_dir, &store) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to load peer certificate directory: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    let server_id = match cert::identity_of(&own_cert_der) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("own certificate has no usable common name: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = cert::validate(&store, &own_cert_der) {
        eprintln!("own certificate does not validate against the CA store: {}", e);
        process::exit(EXIT_CONFIG);
    }

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("server: listening on {} as {}, {} peer(s) in directory", addr, server_id, directory.len());

    let dispatcher = match Dispatcher::new(addr, &server_id, signing_key, own_cert_der, directory, Registry::new(), DEFAULT_WORKER_COUNT) {
        Ok(d) => d,
        Err(e) => {
            error!("server: failed to start: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = dispatcher.run() {
        error!("server: dispatcher loop exited: {}", e);
        process::exit(EXIT_FATAL);
    }
}
