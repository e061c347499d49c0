// matchmaking.rs - per-user state machine and challenge mediation (C7)
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

//! Per-user state transitions (spec §4.7): `JUST_CONNECTED` through
//! `PLAYING`/`DISCONNECTED`, challenge dispatch, and challenge
//! response. Two-user operations acquire both per-user locks in
//! ascending identity order — the only protection against deadlock.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::codec::Message;
use crate::directory::PeerDirectory;
use crate::registry::Registry;

/// A user's position in the per-connection lifecycle (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    JustConnected,
    SecurelyConnected,
    Available,
    Challenged,
    Playing,
    Disconnected,
}

/// A registered (or not-yet-registered) connection's matchmaking
/// record. The per-user lock is the `Mutex` the registry wraps this
/// in; handlers below acquire it directly or via `lock_pair`.
pub struct User {
    pub identity: Option<String>,
    pub fd: i32,
    pub state: MatchState,
    pub opponent: Option<String>,
    pub peer_ip: Ipv4Addr,
    pub listen_port: u16,
}

impl User {
    pub fn new_just_connected() -> User {
        User {
            identity: None,
            fd: -1,
            state: MatchState::JustConnected,
            opponent: None,
            peer_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
        }
    }

    pub fn with_fd(fd: i32, peer_ip: Ipv4Addr) -> User {
        User {
            fd,
            peer_ip,
            ..User::new_just_connected()
        }
    }
}

/// Sends a message to the connection owning `fd`. Implemented by the
/// server dispatcher, which owns the actual sockets and secure
/// channels; matchmaking only knows identities and state.
pub trait Sender {
    fn send(&mut self, fd: i32, msg: Message) -> bool;
}

/// Acquires both per-user locks in ascending identity order,
/// returning guards in `(u, v)` order regardless of which lock was
/// physically taken first (spec §4.7, "paired locking").
fn lock_pair<'a>(
    u_lock: &'a Mutex<User>,
    u_id: &str,
    v_lock: &'a Mutex<User>,
    v_id: &str,
) -> (MutexGuard<'a, User>, MutexGuard<'a, User>) {
    if u_id <= v_id {
        let u = u_lock.lock().unwrap();
        let v = v_lock.lock().unwrap();
        (u, v)
    } else {
        let v = v_lock.lock().unwrap();
        let u = u_lock.lock().unwrap();
        (u, v)
    }
}

fn user_fd(user: &Arc<Mutex<User>>) -> i32 {
    user.lock().unwrap().fd
}

/// REGISTER(id): AVAILABLE if `id` is in the directory and unused,
/// else DISCONNECTED.
pub fn handle_register(registry: &Registry, directory: &PeerDirectory, fd: i32, identity: &str) -> bool {
    if !directory.contains(identity) || registry.exists_id(identity) {
        if let Ok(user) = registry.get_by_fd(fd) {
            user.lock().unwrap().state = MatchState::Disconnected;
            registry.yield_user(fd);
        }
        return false;
    }

    let user = match registry.get_by_fd(fd) {
        Ok(u) => u,
        Err(_) => return false,
    };
    if registry.bind_identity(fd, identity).is_err() {
        user.lock().unwrap().state = MatchState::Disconnected;
        registry.yield_user(fd);
        return false;
    }
    {
        let mut u = user.lock().unwrap();
        u.identity = Some(identity.to_string());
        u.state = MatchState::Available;
    }
    registry.yield_user(fd);
    true
}

/// Challenge dispatch: server-side handling of `CHALLENGE(opponent)`
/// from user `u_id` (spec §4.7 "Challenge dispatch").
pub fn handle_challenge(registry: &Registry, sender: &mut dyn Sender, u_id: &str, v_id: &str) {
    if u_id == v_id || !registry.exists_id(v_id) {
        cancel_to(registry, sender, u_id, v_id);
        return;
    }

    let u_arc = match registry.get_by_id(u_id) {
        Ok(a) => a,
        Err(_) => return,
    };
    let v_arc = match registry.get_by_id(v_id) {
        Ok(a) => a,
        Err(_) => {
            cancel_to(registry, sender, u_id, v_id);
            registry.yield_user(user_fd(&u_arc));
            return;
        }
    };

    {
        let (mut u, mut v) = lock_pair(&u_arc, u_id, &v_arc, v_id);
        if u.state != MatchState::Available {
            // Released below; silently drop per spec.
        } else if v.state != MatchState::Available {
            sender.send(u.fd, Message::GameCancel { opponent: v_id.to_string() });
        } else {
            let sent = sender.send(v.fd, Message::ChallengeFwd { challenger: u_id.to_string() });
            if sent {
                u.state = MatchState::Challenged;
                u.opponent = Some(v_id.to_string());
                v.state = MatchState::Challenged;
                v.opponent = Some(u_id.to_string());
                info!("matchmaking: {} challenged {}", u_id, v_id);
            } else {
                v.state = MatchState::Disconnected;
                sender.send(u.fd, Message::GameCancel { opponent: v_id.to_string() });
            }
        }
    }

    registry.yield_user(user_fd(&u_arc));
    registry.yield_user(user_fd(&v_arc));
}

fn cancel_to(registry: &Registry, sender: &mut dyn Sender, u_id: &str, v_id: &str) {
    if let Ok(u_arc) = registry.get_by_id(u_id) {
        let fd = user_fd(&u_arc);
        sender.send(fd, Message::GameCancel { opponent: v_id.to_string() });
        registry.yield_user(fd);
    }
}

/// Challenge response: handling `CHALLENGE_RESP{accept, listen_port,
/// challenger_id}` from `v_id` (spec §4.7 "Challenge response"). The
/// embedded `challenger_id` is checked against `v`'s recorded
/// opponent so a stale response (e.g. after a cancelled challenge) is
/// tolerated rather than corrupting an unrelated pairing.
pub fn handle_challenge_response(
    registry: &Registry,
    directory: &PeerDirectory,
    sender: &mut dyn Sender,
    v_id: &str,
    accept: bool,
    listen_port: u16,
    challenger_id: &str,
) {
    let v_arc = match registry.get_by_id(v_id) {
        Ok(a) => a,
        Err(_) => return,
    };

    let u_id = {
        let v = v_arc.lock().unwrap();
        v.opponent.clone()
    };
    let u_id = match u_id {
        Some(id) if id == challenger_id => id,
        _ => {
            let mut v = v_arc.lock().unwrap();
            v.state = MatchState::Available;
            sender.send(v.fd, Message::GameCancel {
                opponent: challenger_id.to_string(),
            });
            drop(v);
            registry.yield_user(user_fd(&v_arc));
            return;
        }
    };

    let u_arc = match registry.get_by_id(&u_id) {
        Ok(a) => a,
        Err(_) => {
            let mut v = v_arc.lock().unwrap();
            v.state = MatchState::Available;
            sender.send(v.fd, Message::GameCancel { opponent: u_id });
            drop(v);
            registry.yield_user(user_fd(&v_arc));
            return;
        }
    };

    {
        let (mut u, mut v) = lock_pair(&u_arc, &u_id, &v_arc, v_id);

        if !accept {
            v.state = MatchState::Available;
            let sent = sender.send(u.fd, Message::GameCancel { opponent: v_id.to_string() });
            u.state = if sent { MatchState::Available } else { MatchState::Disconnected };
        } else {
            v.listen_port = listen_port;
            let addr_v = SocketAddrV4::new(v.peer_ip, listen_port);
            let addr_u = SocketAddrV4::new(u.peer_ip, 0);

            let cert_v = directory.get(v_id).map(|c| c.to_vec());
            let cert_u = directory.get(&u_id).map(|c| c.to_vec());

            match (cert_v, cert_u) {
                (Some(cert_v), Some(cert_u)) => {
                    let sent_to_u = sender.send(
                        u.fd,
                        Message::GameStart {
                            opponent: v_id.to_string(),
                            addr: addr_v,
                            opponent_cert: cert_v,
                        },
                    );
                    let sent_to_v = sender.send(
                        v.fd,
                        Message::GameStart {
                            opponent: u_id.clone(),
                            addr: addr_u,
                            opponent_cert: cert_u,
                        },
                    );
                    match (sent_to_u, sent_to_v) {
                        (true, true) => {
                            u.state = MatchState::Playing;
                            v.state = MatchState::Playing;
                        }
                        (true, false) => {
                            sender.send(u.fd, Message::GameCancel { opponent: v_id.to_string() });
                            u.state = MatchState::Available;
                            v.state = MatchState::Disconnected;
                        }
                        (false, true) => {
                            sender.send(v.fd, Message::GameCancel { opponent: u_id.clone() });
                            v.state = MatchState::Available;
                            u.state = MatchState::Disconnected;
                        }
                        (false, false) => {
                            u.state = MatchState::Disconnected;
                            v.state = MatchState::Disconnected;
                        }
                    }
                }
                _ => {
                    warn!("matchmaking: missing certificate for {} or {}, cancelling", u_id, v_id);
                    sender.send(u.fd, Message::GameCancel { opponent: v_id.to_string() });
                    sender.send(v.fd, Message::GameCancel { opponent: u_id.clone() });
                    u.state = MatchState::Available;
                    v.state = MatchState::Available;
                }
            }
        }
    }

    registry.yield_user(user_fd(&u_arc));
    registry.yield_user(user_fd(&v_arc));
}

/// GAME_END: PLAYING -> AVAILABLE.
pub fn handle_game_end(registry: &Registry, fd: i32) {
    if let Ok(user) = registry.get_by_fd(fd) {
        let mut u = user.lock().unwrap();
        if u.state == MatchState::Playing {
            u.state = MatchState::Available;
            u.opponent = None;
        }
        drop(u);
        registry.yield_user(fd);
    }
}

/// Peer TCP closed, or a handler hit a connection error: any state to
/// DISCONNECTED.
pub fn handle_disconnect(registry: &Registry, fd: i32) {
    if let Ok(user) = registry.get_by_fd(fd) {
        user.lock().unwrap().state = MatchState::Disconnected;
        registry.yield_user(fd);
    }
}

/// Routes one decrypted application message to its C7 handler, gating on
/// the user's current state the way the original dispatch loop's
/// per-state `switch` does (spec §4.7's transition table). Unexpected
/// state/message combinations are logged and otherwise ignored.
pub fn route(registry: &Registry, directory: &PeerDirectory, sender: &mut dyn Sender, fd: i32, msg: Message) {
    let user = match registry.get_by_fd(fd) {
        Ok(u) => u,
        Err(_) => return,
    };
    let (state, identity) = {
        let u = user.lock().unwrap();
        (u.state, u.identity.clone())
    };
    drop(user);

    match (state, &msg) {
        (MatchState::SecurelyConnected, Message::Register { identity: id }) => {
            registry.yield_user(fd);
            handle_register(registry, directory, fd, id);
            return;
        }
        (MatchState::Available, Message::UsersListReq { offset }) => {
            let page = registry.list_available(*offset as usize);
            sender.send(fd, Message::UsersList { identities: page });
        }
        (MatchState::Available, Message::Challenge { opponent }) => {
            if let Some(u_id) = identity {
                registry.yield_user(fd);
                handle_challenge(registry, sender, &u_id, opponent);
                return;
            }
        }
        (MatchState::Challenged, Message::ChallengeResp { accept, listen_port, challenger_id }) => {
            if let Some(v_id) = identity {
                registry.yield_user(fd);
                handle_challenge_response(registry, directory, sender, &v_id, *accept, *listen_port, challenger_id);
                return;
            }
        }
        (MatchState::Playing, Message::GameEnd) => {
            handle_game_end(registry, fd);
        }
        _ => {
            warn!("matchmaking: user {:?} (state {:?}) sent an unexpected message", identity, state);
        }
    }
    registry.yield_user(fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingSender {
        sent: HashMap<i32, Vec<Message>>,
        fail_fds: Vec<i32>,
    }

    impl Sender for RecordingSender {
        fn send(&mut self, fd: i32, msg: Message) -> bool {
            if self.fail_fds.contains(&fd) {
                return false;
            }
            self.sent.entry(fd).or_default().push(msg);
            true
        }
    }

    fn setup_two_available(registry: &Registry, directory_fds: (i32, i32)) {
        registry.add(directory_fds.0, User::with_fd(directory_fds.0, Ipv4Addr::new(10, 0, 0, 1))).unwrap();
        registry.add(directory_fds.1, User::with_fd(directory_fds.1, Ipv4Addr::new(10, 0, 0, 2))).unwrap();
        registry.bind_identity(directory_fds.0, "alice").unwrap();
        registry.bind_identity(directory_fds.1, "bob").unwrap();
        for fd in [directory_fds.0, directory_fds.1] {
            let u = registry.get_by_fd(fd).unwrap();
            u.lock().unwrap().state = MatchState::Available;
            registry.yield_user(fd);
        }
    }

    #[test]
    fn challenge_unknown_opponent_is_cancelled() {
        let registry = Registry::new();
        registry.add(1, User::with_fd(1, Ipv4Addr::new(10, 0, 0, 1))).unwrap();
        registry.bind_identity(1, "alice").unwrap();
        let mut sender = RecordingSender::default();
        handle_challenge(&registry, &mut sender, "alice", "ghost");
        assert_eq!(sender.sent[&1].len(), 1);
        assert!(matches!(sender.sent[&1][0], Message::GameCancel { .. }));
    }

    #[test]
    fn challenge_self_is_cancelled() {
        let registry = Registry::new();
        registry.add(1, User::with_fd(1, Ipv4Addr::new(10, 0, 0, 1))).unwrap();
        registry.bind_identity(1, "alice").unwrap();
        let mut sender = RecordingSender::default();
        handle_challenge(&registry, &mut sender, "alice", "alice");
        assert_eq!(sender.sent[&1].len(), 1);
    }

    #[test]
    fn successful_challenge_moves_both_to_challenged() {
        let registry = Registry::new();
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        handle_challenge(&registry, &mut sender, "alice", "bob");

        assert!(matches!(sender.sent[&2][0], Message::ChallengeFwd { .. }));
        let alice = registry.get_by_id("alice").unwrap();
        let bob = registry.get_by_id("bob").unwrap();
        assert_eq!(alice.lock().unwrap().state, MatchState::Challenged);
        assert_eq!(bob.lock().unwrap().state, MatchState::Challenged);
        registry.yield_user(1);
        registry.yield_user(2);
    }

    #[test]
    fn accepted_challenge_response_moves_both_to_playing() {
        let registry = Registry::new();
        let directory = make_test_directory(&["alice", "bob"]);
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        handle_challenge(&registry, &mut sender, "alice", "bob");

        handle_challenge_response(&registry, &directory, &mut sender, "bob", true, 4000, "alice");

        let alice = registry.get_by_id("alice").unwrap();
        let bob = registry.get_by_id("bob").unwrap();
        assert_eq!(alice.lock().unwrap().state, MatchState::Playing);
        assert_eq!(bob.lock().unwrap().state, MatchState::Playing);
        registry.yield_user(1);
        registry.yield_user(2);
    }

    #[test]
    fn rejected_challenge_response_returns_both_to_available() {
        let registry = Registry::new();
        let directory = make_test_directory(&["alice", "bob"]);
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        handle_challenge(&registry, &mut sender, "alice", "bob");

        handle_challenge_response(&registry, &directory, &mut sender, "bob", false, 0, "alice");

        let alice = registry.get_by_id("alice").unwrap();
        let bob = registry.get_by_id("bob").unwrap();
        assert_eq!(alice.lock().unwrap().state, MatchState::Available);
        assert_eq!(bob.lock().unwrap().state, MatchState::Available);
        registry.yield_user(1);
        registry.yield_user(2);
    }

    #[test]
    fn stale_challenge_response_is_tolerated() {
        let registry = Registry::new();
        let directory = make_test_directory(&["alice", "bob"]);
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        // bob was never challenged; a late response naming a stale challenger
        // must not panic or corrupt state.
        handle_challenge_response(&registry, &directory, &mut sender, "bob", true, 4000, "alice");
        let bob = registry.get_by_id("bob").unwrap();
        assert_eq!(bob.lock().unwrap().state, MatchState::Available);
        registry.yield_user(2);
    }

    #[test]
    fn route_dispatches_users_list_req_to_the_available_handler() {
        let registry = Registry::new();
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        route(&registry, &make_test_directory(&["alice", "bob"]), &mut sender, 1, Message::UsersListReq { offset: 0 });
        assert!(matches!(sender.sent[&1][0], Message::UsersList { .. }));
    }

    #[test]
    fn route_ignores_a_message_the_current_state_does_not_accept() {
        let registry = Registry::new();
        setup_two_available(&registry, (1, 2));
        let mut sender = RecordingSender::default();
        // AVAILABLE users do not accept GAME_END.
        route(&registry, &make_test_directory(&["alice", "bob"]), &mut sender, 1, Message::GameEnd);
        assert!(!sender.sent.contains_key(&1));
        let alice = registry.get_by_id("alice").unwrap();
        assert_eq!(alice.lock().unwrap().state, MatchState::Available);
        registry.yield_user(1);
    }

    fn make_test_directory(identities: &[&str]) -> PeerDirectory {
        use crate::crypto::cert::TrustStore;
        use crate::crypto::test_pki;

        let ca = test_pki::make_ca("fourlink-test-ca");
        let crl = test_pki::make_crl(&ca, "fourlink-test-ca", &[]);
        let store = TrustStore::new(ca.der.clone(), crl).unwrap();

        let tmp = std::env::temp_dir().join(format!("fourlink-matchmaking-test-{:x}", rand::random::<u64>()));
        std::fs::create_dir_all(&tmp).unwrap();
        for id in identities {
            let leaf = test_pki::make_leaf(&ca, "fourlink-test-ca", id);
            std::fs::write(tmp.join(format!("{}_cert.der", id)), &leaf.der).unwrap();
        }
        let directory = PeerDirectory::load(&tmp, &store).unwrap();
        std::fs::remove_dir_all(&tmp).ok();
        directory
    }
}
