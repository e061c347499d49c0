// registry.rs - thread-safe user table (C6)
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

//! Indexed twice, by identity and by connection descriptor, with
//! reference-counted deferred destruction (spec §4.6). A single
//! registry mutex serializes index mutations; per-user state lives
//! behind its own lock (see `matchmaking.rs`), acquired by callers
//! after the registry mutex is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::constants::MAX_USERS;
use crate::errors::RegistryError;
use crate::matchmaking::{MatchState, User};

/// A registry entry: the shared user record plus its reference count.
struct Entry {
    user: Arc<Mutex<User>>,
    refs: usize,
}

#[derive(Default)]
struct Inner {
    by_fd: HashMap<i32, usize>,
    by_id: HashMap<String, usize>,
    entries: HashMap<usize, Entry>,
    next_key: usize,
}

/// The shared user table. Cheap to clone (wraps an `Arc`); every
/// connection's dispatcher/worker threads hold a clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Inserts a freshly accepted connection under `fd`, in
    /// `JUST_CONNECTED` with no identity yet. Bounded by `MAX_USERS`.
    pub fn add(&self, fd: i32, user: User) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= MAX_USERS {
            return Err(RegistryError::Full);
        }
        let key = inner.next_key;
        inner.next_key += 1;
        inner.by_fd.insert(fd, key);
        inner.entries.insert(
            key,
            Entry {
                user: Arc::new(Mutex::new(user)),
                refs: 0,
            },
        );
        debug!("registry: added connection fd={}", fd);
        Ok(())
    }

    /// Binds `identity` to the user already registered under `fd`.
    /// Called once REGISTER succeeds (spec §4.7).
    pub fn bind_identity(&self, fd: i32, identity: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let key = *inner.by_fd.get(&fd).ok_or(RegistryError::NotFound)?;
        if inner.by_id.contains_key(identity) {
            return Err(RegistryError::AlreadyRegistered);
        }
        inner.by_id.insert(identity.to_string(), key);
        Ok(())
    }

    /// Looks up a user by identity, incrementing its reference count.
    pub fn get_by_id(&self, identity: &str) -> Result<Arc<Mutex<User>>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let key = *inner.by_id.get(identity).ok_or(RegistryError::NotFound)?;
        let entry = inner.entries.get_mut(&key).ok_or(RegistryError::NotFound)?;
        entry.refs += 1;
        Ok(entry.user.clone())
    }

    /// Looks up a user by connection descriptor, incrementing its
    /// reference count.
    pub fn get_by_fd(&self, fd: i32) -> Result<Arc<Mutex<User>>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let key = *inner.by_fd.get(&fd).ok_or(RegistryError::NotFound)?;
        let entry = inner.entries.get_mut(&key).ok_or(RegistryError::NotFound)?;
        entry.refs += 1;
        Ok(entry.user.clone())
    }

    pub fn exists_id(&self, identity: &str) -> bool {
        self.inner.lock().unwrap().by_id.contains_key(identity)
    }

    pub fn exists_fd(&self, fd: i32) -> bool {
        self.inner.lock().unwrap().by_fd.contains_key(&fd)
    }

    /// Releases a reference obtained from `get_by_id`/`get_by_fd`. If
    /// the count reaches zero and the user's state is `DISCONNECTED`,
    /// removes it from both indices and drops it (spec §4.6).
    pub fn yield_user(&self, fd: i32) {
        let mut inner = self.inner.lock().unwrap();
        let key = match inner.by_fd.get(&fd) {
            Some(&k) => k,
            None => return,
        };

        let state = {
            let entry = match inner.entries.get_mut(&key) {
                Some(e) => e,
                None => return,
            };
            if entry.refs > 0 {
                entry.refs -= 1;
            }
            let refs = entry.refs;
            let state = entry.user.lock().unwrap().state;
            debug!("registry: yielded fd={} (refcount now {})", fd, refs);
            if refs == 0 && state == MatchState::Disconnected {
                Some(state)
            } else {
                None
            }
        };

        if state.is_some() {
            let identity = inner.entries.get(&key).and_then(|e| e.user.lock().unwrap().identity.clone());
            inner.by_fd.remove(&fd);
            if let Some(id) = identity {
                inner.by_id.remove(&id);
            }
            inner.entries.remove(&key);
            debug!("registry: destroyed user record for fd={}", fd);
        }
    }

    /// Up to `USERS_LIST_PAGE_SIZE` identities currently `AVAILABLE`,
    /// starting at `offset`.
    pub fn list_available(&self, offset: usize) -> Vec<String> {
        use crate::constants::USERS_LIST_PAGE_SIZE;
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<&String> = inner.by_id.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter(|id| {
                let key = inner.by_id[*id];
                inner
                    .entries
                    .get(&key)
                    .map(|e| e.user.lock().unwrap().state == MatchState::Available)
                    .unwrap_or(false)
            })
            .skip(offset)
            .take(USERS_LIST_PAGE_SIZE)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaking::User;

    fn fresh_user() -> User {
        User::new_just_connected()
    }

    #[test]
    fn add_then_get_by_fd_increments_refcount() {
        let reg = Registry::new();
        reg.add(1, fresh_user()).unwrap();
        let u = reg.get_by_fd(1).unwrap();
        assert_eq!(u.lock().unwrap().state, MatchState::JustConnected);
    }

    #[test]
    fn registry_full_rejects_further_adds() {
        let reg = Registry::new();
        for fd in 0..crate::constants::MAX_USERS as i32 {
            reg.add(fd, fresh_user()).unwrap();
        }
        assert!(matches!(reg.add(99999, fresh_user()), Err(RegistryError::Full)));
    }

    #[test]
    fn yield_destroys_only_when_disconnected_and_unreferenced() {
        let reg = Registry::new();
        reg.add(1, fresh_user()).unwrap();
        let u = reg.get_by_fd(1).unwrap();
        reg.yield_user(1);
        assert!(reg.exists_fd(1)); // state is JUST_CONNECTED, not destroyed

        u.lock().unwrap().state = MatchState::Disconnected;
        let u2 = reg.get_by_fd(1).unwrap();
        drop(u2);
        reg.yield_user(1);
        assert!(!reg.exists_fd(1));
    }

    #[test]
    fn bind_identity_rejects_duplicate() {
        let reg = Registry::new();
        reg.add(1, fresh_user()).unwrap();
        reg.add(2, fresh_user()).unwrap();
        reg.bind_identity(1, "alice").unwrap();
        assert!(matches!(reg.bind_identity(2, "alice"), Err(RegistryError::AlreadyRegistered)));
    }

    #[test]
    fn list_available_honors_offset_and_page_size() {
        let reg = Registry::new();
        for (fd, id) in [(1, "a"), (2, "b"), (3, "c")] {
            reg.add(fd, fresh_user()).unwrap();
            reg.bind_identity(fd, id).unwrap();
            let u = reg.get_by_fd(fd).unwrap();
            u.lock().unwrap().state = MatchState::Available;
            reg.yield_user(fd);
        }
        let page = reg.list_available(1);
        assert_eq!(page, vec!["b".to_string(), "c".to_string()]);
    }
}
