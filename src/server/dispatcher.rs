// server/dispatcher.rs - readiness-multiplexed TCP dispatcher (C8)
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

//! One thread owns the `mio` readiness loop: it accepts connections,
//! drives CERT_REQ/CLIENT_HELLO/CLIENT_VERIFY in cleartext, and is the
//! only thread that ever decrypts a `SECURE_MESSAGE` (so a
//! connection's receive sequence counter only ever advances from one
//! place). Decrypted application messages are hand off to a bounded
//! queue; a fixed worker pool drains it and calls `matchmaking::route`.
//! Workers talk back to a connection through `DispatcherSender`, which
//! shares the same per-connection socket and channel state the
//! dispatcher thread uses, each behind its own mutex (spec §5).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info, warn};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::channel::{Handshake, SecureChannel};
use crate::codec::Message;
use crate::crypto::cert;
use crate::directory::PeerDirectory;
use crate::errors::{DispatchError, Error};
use crate::framing::{self, PartialReader};
use crate::matchmaking::{self, MatchState, Sender as MatchSender, User};
use crate::registry::Registry;
use crate::server::queue::{WorkItem, WorkQueue};

const SERVER_TOKEN: Token = Token(0);

/// Handshake-or-established state behind a connection's own lock.
/// `Pending` only ever exists for the instant a consuming handshake
/// step (which needs the `Handshake` by value) is in progress.
enum ConnState {
    Handshaking(Handshake),
    Secure(SecureChannel),
    Pending,
}

/// The two pieces of shared state a worker thread needs to talk back
/// to a connection: the raw socket and the secure channel, each
/// independently lockable so a slow write never blocks the
/// dispatcher's next decrypt.
#[derive(Clone)]
struct ConnHandle {
    stream: Arc<Mutex<TcpStream>>,
    state: Arc<Mutex<ConnState>>,
}

fn send_cleartext(handle: &ConnHandle, msg: &Message) -> bool {
    let mut stream = handle.stream.lock().unwrap();
    framing::send_frame_nonblocking(&mut *stream, &msg.to_bytes()).is_ok()
}

/// Implements `matchmaking::Sender` for the worker pool: looks up the
/// connection by descriptor, encrypts under its secure channel, and
/// writes the frame. Never touches the dispatcher's own bookkeeping
/// (the `PartialReader`s and token map), which stays thread-exclusive.
struct DispatcherSender {
    conns: Arc<Mutex<HashMap<i32, ConnHandle>>>,
}

impl MatchSender for DispatcherSender {
    fn send(&mut self, fd: i32, msg: Message) -> bool {
        let handle = match self.conns.lock().unwrap().get(&fd) {
            Some(h) => h.clone(),
            None => return false,
        };
        let mut state = handle.state.lock().unwrap();
        let channel = match &mut *state {
            ConnState::Secure(ch) => ch,
            _ => return false,
        };
        let encrypted = match channel.encrypt(&msg.to_bytes()) {
            Ok(m) => m,
            Err(e) => {
                warn!("dispatcher: encrypt failed for fd={}: {}", fd, e);
                return false;
            }
        };
        drop(state);
        let mut stream = handle.stream.lock().unwrap();
        framing::send_frame_nonblocking(&mut *stream, &encrypted.to_bytes()).is_ok()
    }
}

/// The matchmaking server's accept-and-dispatch loop.
pub struct Dispatcher {
    listener: TcpListener,
    poll: Poll,
    registry: Registry,
    directory: Arc<PeerDirectory>,
    conns: Arc<Mutex<HashMap<i32, ConnHandle>>>,
    queue: Arc<WorkQueue>,
    server_id: String,
    signing_key: Vec<u8>,
    own_cert: Vec<u8>,
    worker_count: usize,
    next_fd: i32,
    readers: HashMap<i32, PartialReader>,
}

impl Dispatcher {
    pub fn new(
        listen_addr: SocketAddr,
        server_id: &str,
        signing_key: Vec<u8>,
        own_cert: Vec<u8>,
        directory: PeerDirectory,
        registry: Registry,
        worker_count: usize,
    ) -> Result<Dispatcher, Error> {
        let mut listener = TcpListener::bind(listen_addr).map_err(DispatchError::from)?;
        let poll = Poll::new().map_err(DispatchError::from)?;
        poll.registry()
            .register(&mut listener, SERVER_TOKEN, Interest::READABLE)
            .map_err(DispatchError::from)?;
        Ok(Dispatcher {
            listener,
            poll,
            registry,
            directory: Arc::new(directory),
            conns: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(WorkQueue::new()),
            server_id: server_id.to_string(),
            signing_key,
            own_cert,
            worker_count,
            next_fd: 1,
            readers: HashMap::new(),
        })
    }

    /// The address actually bound, useful when `Dispatcher::new` was
    /// given port 0 and the caller needs to learn what the OS picked.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns the worker pool and runs the readiness loop. Does not
    /// return unless `mio` itself fails.
    pub fn run(mut self) -> Result<(), Error> {
        for id in 0..self.worker_count {
            let queue = self.queue.clone();
            let registry = self.registry.clone();
            let directory = self.directory.clone();
            let conns = self.conns.clone();
            thread::Builder::new()
                .name(format!("fourlink-worker-{}", id))
                .spawn(move || worker_loop(queue, registry, directory, conns))
                .map_err(DispatchError::from)?;
        }
        info!("dispatcher: {} worker(s) started", self.worker_count);

        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, None).map_err(DispatchError::from)?;
            for event in events.iter() {
                if event.token() == SERVER_TOKEN {
                    self.accept_all();
                } else if event.is_readable() {
                    self.handle_readable(event.token().0 as i32);
                }
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let fd = self.next_fd;
                    self.next_fd += 1;
                    let token = Token(fd as usize);
                    if let Err(e) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                        warn!("dispatcher: failed to register fd={}: {}", fd, e);
                        continue;
                    }
                    let peer_ip = match addr.ip() {
                        std::net::IpAddr::V4(v4) => v4,
                        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    };
                    if self.registry.add(fd, User::with_fd(fd, peer_ip)).is_err() {
                        warn!("dispatcher: registry full, dropping fd={}", fd);
                        continue;
                    }
                    let hs = Handshake::start_responder(&self.server_id, &self.signing_key);
                    let handle = ConnHandle {
                        stream: Arc::new(Mutex::new(stream)),
                        state: Arc::new(Mutex::new(ConnState::Handshaking(hs))),
                    };
                    self.conns.lock().unwrap().insert(fd, handle);
                    self.readers.insert(fd, PartialReader::new());
                    debug!("dispatcher: accepted fd={} from {}", fd, addr);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("dispatcher: accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, fd: i32) {
        let handle = match self.conns.lock().unwrap().get(&fd) {
            Some(h) => h.clone(),
            None => return,
        };
        let mut reader = match self.readers.remove(&fd) {
            Some(r) => r,
            None => return,
        };

        let mut disconnect = false;
        loop {
            let frame = {
                let mut stream = handle.stream.lock().unwrap();
                reader.poll(&mut *stream)
            };
            match frame {
                Ok(Some(payload)) => {
                    let frame_len = match framing::frame_total_len(payload.len()) {
                        Ok(n) => n,
                        Err(_) => {
                            disconnect = true;
                            break;
                        }
                    };
                    if self.handle_frame(fd, &handle, &payload, frame_len).is_err() {
                        disconnect = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("dispatcher: fd={} read error: {}", fd, e);
                    disconnect = true;
                    break;
                }
            }
        }

        if disconnect {
            self.evict(fd);
        } else {
            self.readers.insert(fd, reader);
        }
    }

    /// Handles one decoded frame for a connection still in cleartext
    /// handshake, or routes a `SECURE_MESSAGE` through decrypt and the
    /// wire codec's second pass onto the work queue.
    fn handle_frame(&self, fd: i32, handle: &ConnHandle, payload: &[u8], frame_len: u16) -> Result<(), ()> {
        let msg = Message::from_bytes(payload).map_err(|e| warn!("dispatcher: fd={} malformed message: {}", fd, e))?;

        match msg {
            Message::CertReq => {
                if !send_cleartext(handle, &Message::Certificate { cert: self.own_cert.clone() }) {
                    return Err(());
                }
                Ok(())
            }
            Message::ClientHello { .. } => {
                let mut state = handle.state.lock().unwrap();
                let mut hs = match std::mem::replace(&mut *state, ConnState::Pending) {
                    ConnState::Handshaking(hs) => hs,
                    other => {
                        *state = other;
                        warn!("dispatcher: fd={} CLIENT_HELLO out of order", fd);
                        return Err(());
                    }
                };
                let server_nonce: u32 = rand::random();
                let reply = match hs.on_client_hello(&msg, server_nonce) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("dispatcher: fd={} handshake error: {}", fd, e);
                        return Err(());
                    }
                };
                *state = ConnState::Handshaking(hs);
                drop(state);
                if !send_cleartext(handle, &reply) {
                    return Err(());
                }
                Ok(())
            }
            Message::ClientVerify { .. } => {
                let mut state = handle.state.lock().unwrap();
                let hs = match std::mem::replace(&mut *state, ConnState::Pending) {
                    ConnState::Handshaking(hs) => hs,
                    other => {
                        *state = other;
                        warn!("dispatcher: fd={} CLIENT_VERIFY out of order", fd);
                        return Err(());
                    }
                };
                let peer_id = hs.peer_id().to_string();
                let pubkey = match self.directory.get(&peer_id) {
                    Some(der) => match cert::public_key_sec1(der) {
                        Ok(pk) => pk,
                        Err(_) => {
                            warn!("dispatcher: fd={} malformed directory certificate for {}", fd, peer_id);
                            return Err(());
                        }
                    },
                    None => {
                        warn!("dispatcher: fd={} CLIENT_VERIFY for unknown identity {}", fd, peer_id);
                        return Err(());
                    }
                };
                let channel = match hs.on_client_verify(&msg, &pubkey) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("dispatcher: fd={} handshake failed: {}", fd, e);
                        return Err(());
                    }
                };
                *state = ConnState::Secure(channel);
                drop(state);
                if let Ok(user) = self.registry.get_by_fd(fd) {
                    user.lock().unwrap().state = MatchState::SecurelyConnected;
                    self.registry.yield_user(fd);
                }
                info!("dispatcher: fd={} securely connected as {}", fd, peer_id);
                Ok(())
            }
            Message::SecureMessage { .. } => {
                let plaintext = {
                    let mut state = handle.state.lock().unwrap();
                    let channel = match &mut *state {
                        ConnState::Secure(ch) => ch,
                        _ => {
                            warn!("dispatcher: fd={} SECURE_MESSAGE before handshake complete", fd);
                            return Err(());
                        }
                    };
                    match channel.decrypt(&msg, frame_len) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("dispatcher: fd={} AEAD decrypt failed: {}", fd, e);
                            return Err(());
                        }
                    }
                };
                let inner = Message::from_bytes(&plaintext)
                    .map_err(|e| warn!("dispatcher: fd={} malformed secure payload: {}", fd, e))?;
                if !self.queue.push(WorkItem { fd, msg: inner }) {
                    warn!("dispatcher: fd={} work queue full, dropping message", fd);
                }
                Ok(())
            }
            other => {
                warn!("dispatcher: fd={} unexpected cleartext message {:?}", fd, other);
                Err(())
            }
        }
    }

    fn evict(&mut self, fd: i32) {
        if let Some(handle) = self.conns.lock().unwrap().remove(&fd) {
            if let Ok(mut stream) = handle.stream.lock() {
                let _ = self.poll.registry().deregister(&mut *stream);
            }
        }
        self.readers.remove(&fd);
        matchmaking::handle_disconnect(&self.registry, fd);
        debug!("dispatcher: evicted fd={}", fd);
    }
}

fn worker_loop(queue: Arc<WorkQueue>, registry: Registry, directory: Arc<PeerDirectory>, conns: Arc<Mutex<HashMap<i32, ConnHandle>>>) {
    let mut sender = DispatcherSender { conns };
    loop {
        let item = queue.pull_wait();
        matchmaking::route(&registry, &directory, &mut sender, item.fd, item.msg);
    }
}
