// tests/end_to_end.rs - full client/server scenarios over real sockets
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

//! Drives a real `Dispatcher` over a loopback TCP socket the way two
//! independent client processes would. Requires `--features
//! test-support` for `crypto::test_pki`'s in-memory certificate
//! authority.

#![cfg(feature = "test-support")]

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use fourlink::channel::{Handshake, SecureChannel};
use fourlink::codec::Message;
use fourlink::crypto::cert::{self, TrustStore};
use fourlink::crypto::test_pki::{self, IssuedCert};
use fourlink::directory::PeerDirectory;
use fourlink::framing;
use fourlink::registry::Registry;
use fourlink::server::Dispatcher;

struct TestServer {
    addr: SocketAddr,
    store: TrustStore,
    _dir: PathBuf,
}

fn spawn_server(identities: &[&str]) -> (TestServer, IssuedCert, IssuedCert) {
    let ca = test_pki::make_ca("fourlink-test-ca");
    let server_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "server");
    let crl = test_pki::make_crl(&ca, "fourlink-test-ca", &[]);
    let store = TrustStore::new(ca.der.clone(), crl.clone()).unwrap();

    let dir = std::env::temp_dir().join(format!("fourlink-e2e-{:x}", rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    for id in identities {
        let leaf = test_pki::make_leaf(&ca, "fourlink-test-ca", id);
        std::fs::write(dir.join(format!("{}_cert.der", id)), &leaf.der).unwrap();
    }

    let directory_store = TrustStore::new(ca.der.clone(), crl).unwrap();
    let directory = PeerDirectory::load(&dir, &directory_store).unwrap();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let dispatcher = Dispatcher::new(
        addr,
        "server",
        server_cert.signing_key.to_bytes().to_vec(),
        server_cert.der.clone(),
        directory,
        Registry::new(),
        2,
    )
    .unwrap();
    let bound = dispatcher.local_addr().unwrap();

    std::thread::spawn(move || {
        dispatcher.run().ok();
    });
    // Give the listener a moment to start accepting.
    std::thread::sleep(Duration::from_millis(50));

    (
        TestServer {
            addr: bound,
            store,
            _dir: dir,
        },
        server_cert,
        ca,
    )
}

/// Runs CERT_REQ/CERTIFICATE and the initiator side of the handshake
/// exactly as `bin/client.rs` does, returning the raw socket (still
/// blocking) and the resulting secure channel.
fn handshake(server: &TestServer, own_id: &str, own_key: &IssuedCert) -> (TcpStream, SecureChannel) {
    let mut sock = TcpStream::connect(server.addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    framing::send_frame(&mut sock, &Message::CertReq.to_bytes()).unwrap();
    let payload = framing::recv_frame_blocking(&mut sock).unwrap();
    let server_cert = match Message::from_bytes(&payload).unwrap() {
        Message::Certificate { cert } => cert,
        other => panic!("expected CERTIFICATE, got {:?}", other),
    };
    cert::validate(&server.store, &server_cert).unwrap();
    let server_pubkey = cert::public_key_sec1(&server_cert).unwrap();

    let (mut hs, client_hello) = Handshake::start_initiator(own_id, "server", &own_key.signing_key.to_bytes(), rand::random());
    framing::send_frame(&mut sock, &client_hello.to_bytes()).unwrap();

    let payload = framing::recv_frame_blocking(&mut sock).unwrap();
    let server_hello = Message::from_bytes(&payload).unwrap();
    let client_verify = hs.on_server_hello(&server_hello, &server_pubkey).unwrap();
    framing::send_frame(&mut sock, &client_verify.to_bytes()).unwrap();

    let channel = hs.finish_initiator().unwrap();
    (sock, channel)
}

fn send_app(sock: &mut TcpStream, channel: &mut SecureChannel, msg: Message) {
    let encrypted = channel.encrypt(&msg.to_bytes()).unwrap();
    framing::send_frame(sock, &encrypted.to_bytes()).unwrap();
}

fn recv_app(sock: &mut TcpStream, channel: &mut SecureChannel) -> Message {
    let payload = framing::recv_frame_blocking(sock).unwrap();
    let frame_len = framing::frame_total_len(payload.len()).unwrap();
    let outer = Message::from_bytes(&payload).unwrap();
    let inner = channel.decrypt(&outer, frame_len).unwrap();
    Message::from_bytes(&inner).unwrap()
}

fn register(sock: &mut TcpStream, channel: &mut SecureChannel, identity: &str) {
    send_app(
        sock,
        channel,
        Message::Register {
            identity: identity.to_string(),
        },
    );
}

#[test]
fn handshake_register_and_list_round_trip() {
    let (server, _server_cert, ca) = spawn_server(&["alice"]);
    let alice_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");

    let (mut sock, mut channel) = handshake(&server, "alice", &alice_cert);
    register(&mut sock, &mut channel, "alice");

    send_app(&mut sock, &mut channel, Message::UsersListReq { offset: 0 });
    let reply = recv_app(&mut sock, &mut channel);
    // alice herself is not listed as an opponent candidate by identity
    // filtering rules here; the list simply reflects everyone AVAILABLE,
    // which at this point is just alice.
    match reply {
        Message::UsersList { identities } => assert_eq!(identities, vec!["alice".to_string()]),
        other => panic!("expected USERS_LIST, got {:?}", other),
    }
}

#[test]
fn users_list_is_paginated_at_ten_per_page() {
    let ids: Vec<String> = (0..12).map(|i| format!("u{:02}", i)).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let (server, _server_cert, ca) = spawn_server(&id_refs);

    // Register all twelve, keeping every connection open so they stay AVAILABLE.
    let mut conns = Vec::new();
    for id in &ids {
        let leaf = test_pki::make_leaf(&ca, "fourlink-test-ca", id);
        let (mut sock, mut channel) = handshake(&server, id, &leaf);
        register(&mut sock, &mut channel, id);
        conns.push((sock, channel));
    }

    let (sock, channel) = &mut conns[0];
    send_app(sock, channel, Message::UsersListReq { offset: 0 });
    let first_page = match recv_app(sock, channel) {
        Message::UsersList { identities } => identities,
        other => panic!("expected USERS_LIST, got {:?}", other),
    };
    assert_eq!(first_page.len(), 10);

    send_app(sock, channel, Message::UsersListReq { offset: 10 });
    let second_page = match recv_app(sock, channel) {
        Message::UsersList { identities } => identities,
        other => panic!("expected USERS_LIST, got {:?}", other),
    };
    assert_eq!(second_page.len(), 2);
}

#[test]
fn accepted_challenge_delivers_game_start_with_the_accepted_listen_port() {
    let (server, _server_cert, ca) = spawn_server(&["alice", "bob"]);
    let alice_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");
    let bob_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "bob");

    let (mut a_sock, mut a_chan) = handshake(&server, "alice", &alice_cert);
    register(&mut a_sock, &mut a_chan, "alice");
    let (mut b_sock, mut b_chan) = handshake(&server, "bob", &bob_cert);
    register(&mut b_sock, &mut b_chan, "bob");

    send_app(&mut a_sock, &mut a_chan, Message::Challenge { opponent: "bob".to_string() });
    match recv_app(&mut b_sock, &mut b_chan) {
        Message::ChallengeFwd { challenger } => assert_eq!(challenger, "alice"),
        other => panic!("expected CHALLENGE_FWD, got {:?}", other),
    }

    send_app(
        &mut b_sock,
        &mut b_chan,
        Message::ChallengeResp {
            accept: true,
            listen_port: 9000,
            challenger_id: "alice".to_string(),
        },
    );

    match recv_app(&mut a_sock, &mut a_chan) {
        Message::GameStart { opponent, addr, .. } => {
            assert_eq!(opponent, "bob");
            assert_eq!(addr.port(), 9000);
        }
        other => panic!("expected GAME_START, got {:?}", other),
    }
    match recv_app(&mut b_sock, &mut b_chan) {
        Message::GameStart { opponent, .. } => assert_eq!(opponent, "alice"),
        other => panic!("expected GAME_START, got {:?}", other),
    }
}

#[test]
fn refused_challenge_returns_game_cancel_to_the_challenger() {
    let (server, _server_cert, ca) = spawn_server(&["alice", "bob"]);
    let alice_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");
    let bob_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "bob");

    let (mut a_sock, mut a_chan) = handshake(&server, "alice", &alice_cert);
    register(&mut a_sock, &mut a_chan, "alice");
    let (mut b_sock, mut b_chan) = handshake(&server, "bob", &bob_cert);
    register(&mut b_sock, &mut b_chan, "bob");

    send_app(&mut a_sock, &mut a_chan, Message::Challenge { opponent: "bob".to_string() });
    recv_app(&mut b_sock, &mut b_chan); // CHALLENGE_FWD

    send_app(
        &mut b_sock,
        &mut b_chan,
        Message::ChallengeResp {
            accept: false,
            listen_port: 0,
            challenger_id: "alice".to_string(),
        },
    );

    match recv_app(&mut a_sock, &mut a_chan) {
        Message::GameCancel { opponent } => assert_eq!(opponent, "bob"),
        other => panic!("expected GAME_CANCEL, got {:?}", other),
    }
}

#[test]
fn a_replayed_record_is_rejected_and_the_connection_is_dropped() {
    let (server, _server_cert, ca) = spawn_server(&["alice"]);
    let alice_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");

    let (mut sock, mut channel) = handshake(&server, "alice", &alice_cert);
    register(&mut sock, &mut channel, "alice");

    let encrypted = channel.encrypt(&Message::UsersListReq { offset: 0 }.to_bytes()).unwrap();
    let frame = encrypted.to_bytes();
    framing::send_frame(&mut sock, &frame).unwrap();
    recv_app(&mut sock, &mut channel); // the legitimate reply

    // Replaying the exact same ciphertext: the server's receive sequence
    // has already advanced past the IV this record was sealed under.
    framing::send_frame(&mut sock, &frame).unwrap();
    let result = framing::recv_frame_blocking(&mut sock);
    assert!(result.is_err(), "server should have dropped the connection after a failed AEAD decrypt");
}

#[test]
fn tampered_ciphertext_is_rejected_and_the_connection_is_dropped() {
    let (server, _server_cert, ca) = spawn_server(&["alice"]);
    let alice_cert = test_pki::make_leaf(&ca, "fourlink-test-ca", "alice");

    let (mut sock, mut channel) = handshake(&server, "alice", &alice_cert);
    register(&mut sock, &mut channel, "alice");

    let encrypted = channel.encrypt(&Message::UsersListReq { offset: 0 }.to_bytes()).unwrap();
    let mut frame = encrypted.to_bytes();
    let last = frame.len() - 1;
    frame[last] ^= 0xff; // flip a bit in the trailing authentication tag

    framing::send_frame(&mut sock, &frame).unwrap();
    let result = framing::recv_frame_blocking(&mut sock);
    assert!(result.is_err(), "server should have dropped the connection after a tampered record");
}
