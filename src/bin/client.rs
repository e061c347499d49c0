// bin/client.rs - fourlink interactive client entry point
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

//! Positional arguments (spec §6): own certificate, own private key,
//! CA certificate, CRL, and an optional peer certificate path used only
//! to pre-validate a direct `peer` connection's counterpart offline.
//!
//! The handshake itself runs over a plain blocking `std::net::TcpStream`
//! (CERT_REQ/CERTIFICATE, then CLIENT_HELLO/SERVER_HELLO/CLIENT_VERIFY
//! are all small, synchronous, request-response exchanges with nothing
//! else to multiplex against). Once the channel is established the
//! client hands the socket to `mio` so it can wait on the terminal and
//! the secure socket at the same time: the server can push CHALLENGE_FWD
//! or GAME_CANCEL at any moment, independent of whatever verb the
//! player is in the middle of typing. A read that `mio` reports ready
//! is then drained with the same blocking framing helpers the dispatcher
//! avoids only because it serves thousands of connections at once; a
//! client has exactly one.

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::process;

use log::{error, warn};

use mio::net::TcpStream as MioTcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use fourlink::channel::{Handshake, SecureChannel};
use fourlink::codec::Message;
use fourlink::constants::{EXIT_CONFIG, EXIT_CONNECTION};
use fourlink::crypto::cert::{self, TrustStore};
use fourlink::framing::{self, PartialReader};

const STDIN_TOKEN: Token = Token(0);
const SOCK_TOKEN: Token = Token(1);

struct Args {
    own_cert: Vec<u8>,
    own_key: Vec<u8>,
    store: TrustStore,
    own_id: String,
    #[allow(dead_code)]
    peer_cert: Option<Vec<u8>>,
}

fn usage(argv0: &str) -> ! {
    eprintln!(
        "usage: {} <own_cert.der> <own_key> <ca_cert.der> <crl.der> [peer_cert.der]",
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

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    if argv.len() != 5 && argv.len() != 6 {
        usage(&argv[0]);
    }
    let own_cert = read_file(&argv[1], "own certificate");
    let own_key = read_file(&argv[2], "own private key");
    let ca_cert = read_file(&argv[3], "CA certificate");
    let crl = read_file(&argv[4], "CRL");
    let peer_cert = argv.get(5).map(|p| read_file(p, "peer certificate"));

    let store = match TrustStore::new(ca_cert, crl) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("invalid CA certificate or CRL: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };
    if let Err(e) = cert::validate(&store, &own_cert) {
        eprintln!("own certificate does not validate against the CA store: {}", e);
        process::exit(EXIT_CONFIG);
    }
    let own_id = match cert::identity_of(&own_cert) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("own certificate has no usable common name: {}", e);
            process::exit(EXIT_CONFIG);
        }
    };
    Args {
        own_cert,
        own_key,
        store,
        own_id,
        peer_cert,
    }
}

/// Runs CERT_REQ/CERTIFICATE and the three-message handshake as the
/// initiator, returning the established channel plus the peer's
/// validated identity.
fn connect_secure(addr: SocketAddr, args: &Args) -> io::Result<(TcpStream, SecureChannel, String)> {
    let mut sock = TcpStream::connect(addr)?;

    framing::send_frame(&mut sock, &Message::CertReq.to_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let payload = framing::recv_frame_blocking(&mut sock).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let peer_cert = match Message::from_bytes(&payload) {
        Ok(Message::Certificate { cert }) => cert,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "expected CERTIFICATE")),
    };
    cert::validate(&args.store, &peer_cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let peer_id = cert::identity_of(&peer_cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let peer_pubkey = cert::public_key_sec1(&peer_cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let (mut hs, client_hello) = Handshake::start_initiator(&args.own_id, &peer_id, &args.own_key, rand::random());
    framing::send_frame(&mut sock, &client_hello.to_bytes()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let payload = framing::recv_frame_blocking(&mut sock).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let server_hello = Message::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let client_verify = hs
        .on_server_hello(&server_hello, &peer_pubkey)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    framing::send_frame(&mut sock, &client_verify.to_bytes()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let channel = hs.finish_initiator().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok((sock, channel, peer_id))
}

/// Establishes a peer-to-peer secure channel as the connecting side.
/// No CERT_REQ/CERTIFICATE exchange: the opponent's certificate is
/// already known, either carried in GAME_START or given on the `peer`
/// command line.
fn peer_connect_initiator(
    own_id: &str,
    own_key: &[u8],
    peer_id: &str,
    peer_pubkey: &[u8],
    addr: SocketAddrV4,
) -> io::Result<(TcpStream, SecureChannel)> {
    let mut sock = TcpStream::connect(addr)?;
    let (mut hs, client_hello) = Handshake::start_initiator(own_id, peer_id, own_key, rand::random());
    framing::send_frame(&mut sock, &client_hello.to_bytes()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let payload = framing::recv_frame_blocking(&mut sock).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let server_hello = Message::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let client_verify = hs
        .on_server_hello(&server_hello, peer_pubkey)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    framing::send_frame(&mut sock, &client_verify.to_bytes()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let channel = hs.finish_initiator().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok((sock, channel))
}

/// Establishes a peer-to-peer secure channel as the listening side.
fn peer_accept_responder(
    own_id: &str,
    own_key: &[u8],
    listener: &TcpListener,
    peer_pubkey: &[u8],
) -> io::Result<(TcpStream, SecureChannel)> {
    let (mut sock, _) = listener.accept()?;
    let mut hs = Handshake::start_responder(own_id, own_key);

    let payload = framing::recv_frame_blocking(&mut sock).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let client_hello = Message::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let server_hello = hs
        .on_client_hello(&client_hello, rand::random())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    framing::send_frame(&mut sock, &server_hello.to_bytes()).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let payload = framing::recv_frame_blocking(&mut sock).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let client_verify = Message::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let channel = hs
        .on_client_verify(&client_verify, peer_pubkey)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok((sock, channel))
}

/// Sends START_GAME_PEER, the first message of a peer-to-peer session,
/// then leaves the channel established; the moves themselves are a
/// board-logic concern this crate doesn't implement.
fn announce_peer_session(sock: &mut TcpStream, channel: &mut SecureChannel, peer_id: &str) {
    match channel.encrypt(&Message::StartGamePeer.to_bytes()) {
        Ok(encrypted) => {
            if let Err(e) = framing::send_frame(sock, &encrypted.to_bytes()) {
                warn!("client: failed to send START_GAME_PEER to {}: {}", peer_id, e);
                return;
            }
            println!("peer channel established with {}", peer_id);
        }
        Err(e) => warn!("client: failed to encrypt START_GAME_PEER for {}: {}", peer_id, e),
    }
}

/// Handles the `peer <host> <port> <cert_path>` / `peer <listen_port>
/// <cert_path>` verbs: a direct two-client session outside the
/// matchmaking server, authenticated against the same CA store.
fn handle_peer_verb(own_id: &str, own_key: &[u8], store: &TrustStore, rest: &[&str]) {
    match rest.len() {
        3 => {
            let (host, port_str, cert_path) = (rest[0], rest[1], rest[2]);
            let port: u16 = match port_str.parse() {
                Ok(p) => p,
                Err(_) => {
                    println!("invalid port: {}", port_str);
                    return;
                }
            };
            let addr: SocketAddrV4 = match format!("{}:{}", host, port).parse() {
                Ok(a) => a,
                Err(_) => {
                    println!("invalid host:port: {}:{}", host, port);
                    return;
                }
            };
            let peer_cert = read_file(cert_path, "peer certificate");
            if let Err(e) = cert::validate(store, &peer_cert) {
                println!("peer certificate does not validate against the CA store: {}", e);
                return;
            }
            let peer_id = match cert::identity_of(&peer_cert) {
                Ok(id) => id,
                Err(e) => {
                    println!("peer certificate has no usable common name: {}", e);
                    return;
                }
            };
            let peer_pubkey = match cert::public_key_sec1(&peer_cert) {
                Ok(pk) => pk,
                Err(e) => {
                    println!("malformed peer certificate: {}", e);
                    return;
                }
            };
            match peer_connect_initiator(own_id, own_key, &peer_id, &peer_pubkey, addr) {
                Ok((mut sock, mut channel)) => announce_peer_session(&mut sock, &mut channel, &peer_id),
                Err(e) => println!("failed to connect to peer {}: {}", addr, e),
            }
        }
        2 => {
            let (port_str, cert_path) = (rest[0], rest[1]);
            let port: u16 = match port_str.parse() {
                Ok(p) => p,
                Err(_) => {
                    println!("invalid port: {}", port_str);
                    return;
                }
            };
            let peer_cert = read_file(cert_path, "peer certificate");
            if let Err(e) = cert::validate(store, &peer_cert) {
                println!("peer certificate does not validate against the CA store: {}", e);
                return;
            }
            let peer_id = match cert::identity_of(&peer_cert) {
                Ok(id) => id,
                Err(e) => {
                    println!("peer certificate has no usable common name: {}", e);
                    return;
                }
            };
            let peer_pubkey = match cert::public_key_sec1(&peer_cert) {
                Ok(pk) => pk,
                Err(e) => {
                    println!("malformed peer certificate: {}", e);
                    return;
                }
            };
            let listener = match TcpListener::bind(("0.0.0.0", port)) {
                Ok(l) => l,
                Err(e) => {
                    println!("failed to listen on port {}: {}", port, e);
                    return;
                }
            };
            println!("listening for {} on port {}", peer_id, port);
            match peer_accept_responder(own_id, own_key, &listener, &peer_pubkey) {
                Ok((mut sock, mut channel)) => announce_peer_session(&mut sock, &mut channel, &peer_id),
                Err(e) => println!("peer handshake failed: {}", e),
            }
        }
        _ => println!("usage: peer <host> <port> <cert_path> | peer <listen_port> <cert_path>"),
    }
}

/// A secure, registered session with the rendezvous server.
struct Session {
    poll: Poll,
    sock: MioTcpStream,
    channel: SecureChannel,
    reader: PartialReader,
    pending_challenger: Option<String>,
    own_id: String,
    own_key: Vec<u8>,
    store: TrustStore,
    pending_listener: Option<TcpListener>,
}

impl Session {
    fn new(sock: TcpStream, channel: SecureChannel, args: &Args) -> io::Result<Session> {
        sock.set_nonblocking(true)?;
        let mut sock = MioTcpStream::from_std(sock);
        let poll = Poll::new()?;
        poll.registry().register(&mut sock, SOCK_TOKEN, Interest::READABLE)?;
        let stdin_fd = io::stdin().as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&stdin_fd), STDIN_TOKEN, Interest::READABLE)?;
        Ok(Session {
            poll,
            sock,
            channel,
            reader: PartialReader::new(),
            pending_challenger: None,
            own_id: args.own_id.clone(),
            own_key: args.own_key.clone(),
            store: args.store.clone(),
            pending_listener: None,
        })
    }

    fn send_app(&mut self, msg: Message) -> io::Result<()> {
        let encrypted = self
            .channel
            .encrypt(&msg.to_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        framing::send_frame_nonblocking(&mut self.sock, &encrypted.to_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// Blocks until at least one event is ready, then drains everything
    /// readable and returns the decoded application messages found.
    fn poll_once(&mut self) -> io::Result<(bool, Vec<Message>)> {
        let mut events = Events::with_capacity(8);
        self.poll.poll(&mut events, None)?;
        let mut stdin_ready = false;
        let mut msgs = Vec::new();
        for event in events.iter() {
            match event.token() {
                STDIN_TOKEN => stdin_ready = true,
                SOCK_TOKEN => {
                    loop {
                        let frame_len;
                        let payload = match self.reader.poll(&mut self.sock) {
                            Ok(Some(p)) => {
                                frame_len = framing::frame_total_len(p.len())
                                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                                p
                            }
                            Ok(None) => break,
                            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
                        };
                        let outer = Message::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        let inner_bytes = self
                            .channel
                            .decrypt(&outer, frame_len)
                            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                        let inner = Message::from_bytes(&inner_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        msgs.push(inner);
                    }
                }
                _ => {}
            }
        }
        Ok((stdin_ready, msgs))
    }

    /// Establishes the peer-to-peer channel GAME_START announces: a
    /// nonzero port means we are the challenger and connect out to the
    /// opponent's listener; a zero port means we are the accepting side
    /// and already opened `pending_listener` when we sent CHALLENGE_RESP.
    fn handle_game_start(&mut self, opponent: &str, addr: SocketAddrV4, opponent_cert: &[u8]) {
        let peer_id = cert::identity_of(opponent_cert).unwrap_or_else(|_| opponent.to_string());
        println!("game starting against {} ({}) at {}", opponent, peer_id, addr);

        if let Err(e) = cert::validate(&self.store, opponent_cert) {
            warn!("client: GAME_START carried an untrusted opponent certificate: {}", e);
            return;
        }
        let peer_pubkey = match cert::public_key_sec1(opponent_cert) {
            Ok(pk) => pk,
            Err(e) => {
                warn!("client: GAME_START carried a malformed opponent certificate: {}", e);
                return;
            }
        };

        let established = if addr.port() != 0 {
            peer_connect_initiator(&self.own_id, &self.own_key, &peer_id, &peer_pubkey, addr)
        } else {
            match self.pending_listener.take() {
                Some(listener) => peer_accept_responder(&self.own_id, &self.own_key, &listener, &peer_pubkey),
                None => Err(io::Error::new(io::ErrorKind::Other, "no pending peer listener for accepted challenge")),
            }
        };
        match established {
            Ok((mut peer_sock, mut peer_channel)) => announce_peer_session(&mut peer_sock, &mut peer_channel, &peer_id),
            Err(e) => warn!("client: failed to establish peer channel with {}: {}", peer_id, e),
        }
    }

    fn handle_server_push(&mut self, msg: Message) {
        match msg {
            Message::ChallengeFwd { challenger } => {
                println!("{} has challenged you. accept? (y/n)", challenger);
                self.pending_challenger = Some(challenger);
            }
            Message::GameCancel { opponent } => {
                println!("match with {} was cancelled", opponent);
            }
            Message::UsersList { identities } => {
                if identities.is_empty() {
                    println!("(no users available)");
                } else {
                    for id in identities {
                        println!("  {}", id);
                    }
                }
            }
            Message::GameStart { opponent, addr, opponent_cert } => {
                self.handle_game_start(&opponent, addr, &opponent_cert);
                // Board gameplay is out of scope; conclude the match
                // immediately so matchmaking state on the server
                // returns to AVAILABLE.
                if self.send_app(Message::GameEnd).is_err() {
                    warn!("client: failed to acknowledge GAME_START");
                }
            }
            other => {
                warn!("client: unexpected message from server: {:?}", other);
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if let Some(challenger) = self.pending_challenger.clone() {
            if line == "y" || line == "n" {
                let accept = line == "y";
                let listen_port = if accept {
                    match TcpListener::bind(("0.0.0.0", 0)) {
                        Ok(listener) => {
                            let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                            self.pending_listener = Some(listener);
                            port
                        }
                        Err(e) => {
                            warn!("client: failed to open a peer listener: {}", e);
                            0
                        }
                    }
                } else {
                    0
                };
                if self
                    .send_app(Message::ChallengeResp {
                        accept,
                        listen_port,
                        challenger_id: challenger,
                    })
                    .is_err()
                {
                    warn!("client: failed to send CHALLENGE_RESP");
                }
                self.pending_challenger = None;
                return true;
            }
        }
        let mut parts = line.splitn(2, ' ');
        match parts.next().unwrap_or("") {
            "list" => {
                if self.send_app(Message::UsersListReq { offset: 0 }).is_err() {
                    warn!("client: failed to send USERS_LIST_REQ");
                }
            }
            "challenge" => {
                let opponent = parts.next().unwrap_or("").trim();
                if opponent.is_empty() {
                    println!("usage: challenge <id>");
                } else if self.send_app(Message::Challenge { opponent: opponent.to_string() }).is_err() {
                    warn!("client: failed to send CHALLENGE");
                }
            }
            "peer" => {
                let rest: Vec<&str> = parts.next().unwrap_or("").split_whitespace().collect();
                handle_peer_verb(&self.own_id, &self.own_key, &self.store, &rest);
            }
            "offline" => {
                println!("offline single-player mode is outside this build's scope (board game logic)");
            }
            "exit" => return false,
            "" => {}
            other => println!("unknown command: {}", other),
        }
        true
    }

    fn run(&mut self) -> io::Result<()> {
        let stdin = io::stdin();
        loop {
            let (stdin_ready, msgs) = self.poll_once()?;
            for msg in msgs {
                self.handle_server_push(msg);
            }
            if stdin_ready {
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    return Ok(());
                }
                if !self.handle_line(&line) {
                    return Ok(());
                }
            }
        }
    }
}

fn run_server_verb(args: &Args, host: &str, port: &str, _cert_path: &str) {
    let port: u16 = match port.parse() {
        Ok(p) => p,
        Err(_) => {
            println!("invalid port: {}", port);
            return;
        }
    };
    let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
        Ok(a) => a,
        Err(_) => {
            println!("invalid host:port: {}:{}", host, port);
            return;
        }
    };
    let (sock, mut channel, peer_id) = match connect_secure(addr, args) {
        Ok(v) => v,
        Err(e) => {
            println!("failed to connect to {}: {}", addr, e);
            return;
        }
    };
    println!("securely connected to {} ({})", addr, peer_id);

    let register = Message::Register {
        identity: args.own_id.clone(),
    };
    let encrypted = match channel.encrypt(&register.to_bytes()) {
        Ok(m) => m,
        Err(e) => {
            println!("failed to encrypt REGISTER: {}", e);
            return;
        }
    };
    let mut sock = sock;
    if let Err(e) = framing::send_frame(&mut sock, &encrypted.to_bytes()) {
        println!("failed to send REGISTER: {}", e);
        return;
    }

    let mut session = match Session::new(sock, channel, args) {
        Ok(s) => s,
        Err(e) => {
            println!("failed to start session: {}", e);
            return;
        }
    };
    if let Err(e) = session.run() {
        println!("session ended: {}", e);
    }
}

fn main() {
    env_logger::init();
    let args = parse_args();

    println!("connected as {}", args.own_id);
    println!("commands: server <host> <port> <cert_path> | peer ... | list | challenge <id> | exit");

    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("> ");
        if out.flush().is_err() {
            process::exit(EXIT_CONNECTION);
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("client: stdin read failed: {}", e);
                break;
            }
        }
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next().unwrap_or("") {
            "server" => {
                let host = parts.next().unwrap_or("");
                let port = parts.next().unwrap_or("");
                let cert_path = parts.next().unwrap_or("");
                if host.is_empty() || port.is_empty() || cert_path.is_empty() {
                    println!("usage: server <host> <port> <cert_path>");
                    continue;
                }
                run_server_verb(&args, host, port, cert_path);
            }
            "peer" => {
                let rest: Vec<&str> = parts.collect();
                handle_peer_verb(&args.own_id, &args.own_key, &args.store, &rest);
            }
            "offline" => {
                println!("offline single-player mode is outside this build's scope (board game logic)");
            }
            "exit" => break,
            "" => {}
            other => println!("unknown command: {}", other),
        }
    }
}
