use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::connect_id::ConnectId;

/// An unacknowledged packet is re-sent this long after its previous send.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(300);

/// An unacknowledged packet older than this tears its connection down.
pub const DEADLINE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Granularity of the single timer that walks the cache.
pub const RESEND_TICK: Duration = Duration::from_millis(100);

struct CacheEntry {
    connect: ConnectId,
    /// `None` for connection-management packets (create, release), the data
    /// packet index otherwise. Acks match on this.
    index: Option<u32>,
    bytes: Bytes,
    next_send: Instant,
    deadline: Instant,
}

/// Store of serialized outgoing packets awaiting acknowledgement, shared by
/// create packets and data packets. One instance per trunk core; the lock is
/// only ever held around the collection itself, never across a socket
/// operation. A linear scan is fine at the expected scale of a few hundred
/// live connections.
pub struct RetransmitCache {
    entries: Mutex<Vec<CacheEntry>>,
}

impl Default for RetransmitCache {
    fn default() -> Self {
        RetransmitCache {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl RetransmitCache {
    pub fn insert_connect(&self, connect: ConnectId, bytes: Bytes, now: Instant) {
        self.insert(connect, None, bytes, now);
    }

    pub fn insert_data(&self, connect: ConnectId, index: u32, bytes: Bytes, now: Instant) {
        self.insert(connect, Some(index), bytes, now);
    }

    fn insert(&self, connect: ConnectId, index: Option<u32>, bytes: Bytes, now: Instant) {
        self.entries.lock().unwrap().push(CacheEntry {
            connect,
            index,
            bytes,
            next_send: now + RESEND_TIMEOUT,
            deadline: now + DEADLINE_TIMEOUT,
        });
    }

    /// Returns the packets whose resend timer has elapsed, advancing each
    /// entry's timer by [`RESEND_TIMEOUT`]. The caller sends them after the
    /// lock is released.
    pub fn take_due(&self, now: Instant) -> Vec<(ConnectId, Bytes)> {
        let mut entries = self.entries.lock().unwrap();

        let mut due = Vec::new();
        for entry in entries.iter_mut() {
            if entry.next_send <= now {
                entry.next_send = now + RESEND_TIMEOUT;
                due.push((entry.connect, entry.bytes.clone()));
            }
        }
        due
    }

    /// Removes every entry of each connection that has at least one entry
    /// past its deadline and returns those connection ids once each. The
    /// caller fails the connections.
    pub fn take_expired(&self, now: Instant) -> Vec<ConnectId> {
        let mut entries = self.entries.lock().unwrap();

        let mut expired: Vec<ConnectId> = Vec::new();
        for entry in entries.iter() {
            if entry.deadline <= now && !expired.contains(&entry.connect) {
                expired.push(entry.connect);
            }
        }
        entries.retain(|e| !expired.contains(&e.connect));
        expired
    }

    /// Ack for a connection-management packet: drops the cached create (or
    /// release) entries of this connection. No-op when nothing matches.
    pub fn remove_connect(&self, connect: ConnectId) {
        self.entries
            .lock()
            .unwrap()
            .retain(|e| !(e.connect == connect && e.index.is_none()));
    }

    /// Ack for a data packet: drops exactly the matching entry. No-op when
    /// nothing matches.
    pub fn remove_data(&self, connect: ConnectId, index: u32) {
        self.entries
            .lock()
            .unwrap()
            .retain(|e| !(e.connect == connect && e.index == Some(index)));
    }

    /// Connection teardown: drops everything this connection still has
    /// cached, cancelling all scheduled retransmits.
    pub fn purge(&self, connect: ConnectId) {
        self.entries.lock().unwrap().retain(|e| e.connect != connect);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
