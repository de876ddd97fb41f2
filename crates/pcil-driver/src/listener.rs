//! Registry of callers waiting for unsolicited messages from the remote side.
//!
//! The remote side names a listener by putting its id in the response
//! identifier field of a `SendFromRemote` frame. Id 0 means "nobody".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::{DriverError, Result};
use crate::request::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u32);

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Vec<u8>>>,
    cond: Condvar,
}

#[derive(Debug)]
pub(crate) struct Listeners {
    next: AtomicU32,
    map: Mutex<HashMap<u32, Arc<Mailbox>>>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl Listeners {
    pub(crate) fn register(self: &Arc<Self>) -> Listener {
        let id = loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                break id;
            }
        };
        let mailbox = Arc::new(Mailbox::default());
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&mailbox));
        Listener {
            id: ListenerId(id),
            mailbox,
            registry: Arc::downgrade(self),
        }
    }

    /// Delivers `payload` to listener `id`. Returns false if nobody is registered.
    pub(crate) fn signal(&self, id: u32, payload: Vec<u8>) -> bool {
        let mailbox = self
            .map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        let Some(mailbox) = mailbox else {
            return false;
        };
        mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(payload);
        mailbox.cond.notify_all();
        true
    }

    fn unregister(&self, id: u32) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle returned by `Driver::register_listener`. Dropping it unregisters.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    mailbox: Arc<Mailbox>,
    registry: Weak<Listeners>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration, cancel: &CancelToken) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self
            .mailbox
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(payload) = queue.pop_front() {
                return Ok(Some(payload));
            }
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(Duration::from_millis(20));
            queue = self
                .mailbox
                .cond
                .wait_timeout(queue, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id.0);
        }
    }
}

impl From<ListenerId> for u32 {
    fn from(id: ListenerId) -> Self {
        id.0
    }
}
