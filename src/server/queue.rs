// server/queue.rs - bounded single-producer/multi-consumer work queue
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

//! The dispatcher is the sole producer; the worker pool are the
//! consumers (spec §5). Bounded at `MAX_QUEUE_DEPTH`; a full queue
//! drops the item rather than blocking the dispatcher thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::codec::Message;
use crate::constants::MAX_QUEUE_DEPTH;

/// One pending application message, already decrypted by the dispatcher.
pub struct WorkItem {
    pub fd: i32,
    pub msg: Message,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<WorkItem>,
}

/// A bounded queue with condition-variable wakeups, shared between the
/// dispatcher thread and the worker pool.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            inner: Mutex::new(Inner::default()),
            available: Condvar::new(),
        }
    }

    /// Pushes an item and signals one waiting worker. Returns `false`
    /// (and drops the item) if the queue is already at capacity.
    pub fn push(&self, item: WorkItem) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() >= MAX_QUEUE_DEPTH {
            return false;
        }
        inner.items.push_back(item);
        self.available.notify_one();
        true
    }

    /// Blocks until an item is available, then pops and returns it.
    pub fn pull_wait(&self) -> WorkItem {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.is_empty() {
            inner = self.available.wait(inner).unwrap();
        }
        inner.items.pop_front().unwrap()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

impl Default for WorkQueue {
    fn default() -> WorkQueue {
        WorkQueue::new()
    }
}
