//! Outstanding two-way calls.
//!
//! A [`PendingTable`] belongs to one connection. Caller threads register an
//! entry before sending a request; the dispatch thread resolves it when the
//! reply arrives. Each entry carries a [`Completion`], a single-use slot the
//! caller blocks on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use minirpc_common::{MinirpcError, Result};
use parking_lot::{Condvar, Mutex};

enum Slot {
    Waiting,
    Ready(Result<Bytes>),
    Taken,
}

/// Single-use completion signal for one call.
///
/// The first [`complete`](Completion::complete) wins; later ones are
/// ignored, so a call is never resolved twice.
pub struct Completion {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Waiting),
            ready: Condvar::new(),
        }
    }

    /// Stores the outcome and wakes the waiter. Returns false if the call
    /// was already resolved.
    pub fn complete(&self, outcome: Result<Bytes>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Waiting) {
            return false;
        }
        *slot = Slot::Ready(outcome);
        self.ready.notify_all();
        true
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Waiting)
    }

    /// Blocks until the call is resolved and takes the outcome.
    pub fn wait(&self) -> Result<Bytes> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Waiting) {
            self.ready.wait(&mut slot);
        }
        Self::take(&mut slot)
    }

    /// Like [`wait`](Completion::wait) but gives up after `timeout`,
    /// returning `None` with the call still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Bytes>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Waiting) {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                if matches!(*slot, Slot::Waiting) {
                    return None;
                }
                break;
            }
        }
        Some(Self::take(&mut slot))
    }

    fn take(slot: &mut Slot) -> Result<Bytes> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(outcome) => outcome,
            Slot::Taken => Err(MinirpcError::InvalidArgument(
                "call outcome already taken".to_string(),
            )),
            Slot::Waiting => unreachable!("take called on an unresolved completion"),
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered two-way call.
pub struct PendingEntry {
    pub command: u32,
    pub completion: Arc<Completion>,
}

/// What an inbound reply's sequence number refers to.
pub enum Resolution {
    /// A live call; the entry has been removed from the table.
    Pending(PendingEntry),
    /// A call that was cancelled or timed out before its reply arrived.
    Cancelled,
    /// Nothing this side ever sent, or a duplicate reply.
    Unknown,
}

struct Inner {
    next_sequence: u32,
    entries: HashMap<u32, PendingEntry>,
    cancelled: HashSet<u32>,
    closed: bool,
}

/// Sequence allocation and pending-call bookkeeping for one connection.
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_sequence: 1,
                entries: HashMap::new(),
                cancelled: HashSet::new(),
                closed: false,
            }),
        }
    }

    /// Allocates a sequence number that neither an in-flight call nor a
    /// cancelled call still awaiting its late reply is using.
    pub fn next_sequence(&self) -> u32 {
        let mut inner = self.inner.lock();
        Self::allocate(&mut inner)
    }

    fn allocate(inner: &mut Inner) -> u32 {
        loop {
            let sequence = inner.next_sequence;
            inner.next_sequence = inner.next_sequence.wrapping_add(1);
            if !inner.entries.contains_key(&sequence) && !inner.cancelled.contains(&sequence) {
                return sequence;
            }
        }
    }

    /// Registers a new call for `command`.
    ///
    /// # Errors
    ///
    /// - [`MinirpcError::Disconnected`] once the table has been drained
    /// - [`MinirpcError::InvalidArgument`] when `max_pending` calls are
    ///   already outstanding
    pub fn register(&self, command: u32, max_pending: usize) -> Result<(u32, Arc<Completion>)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(MinirpcError::Disconnected);
        }
        if inner.entries.len() >= max_pending {
            return Err(MinirpcError::InvalidArgument(format!(
                "too many outstanding calls (max {})",
                max_pending
            )));
        }
        let sequence = Self::allocate(&mut inner);
        let completion = Arc::new(Completion::new());
        inner.entries.insert(
            sequence,
            PendingEntry {
                command,
                completion: completion.clone(),
            },
        );
        Ok((sequence, completion))
    }

    /// Removes the entry for a reply that just arrived.
    pub fn resolve(&self, sequence: u32) -> Resolution {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(&sequence) {
            return Resolution::Pending(entry);
        }
        if inner.cancelled.remove(&sequence) {
            Resolution::Cancelled
        } else {
            Resolution::Unknown
        }
    }

    /// Drops an entry whose request never left this side.
    pub fn forget(&self, sequence: u32) {
        self.inner.lock().entries.remove(&sequence);
    }

    /// Cancels a call: removes it and wakes its waiter with
    /// [`MinirpcError::Cancelled`]. Returns false if the call was already
    /// resolved.
    pub fn cancel(&self, sequence: u32) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.remove(&sequence) else {
                return false;
            };
            // Remember the sequence so its late reply is recognised. The set
            // is bounded by clearing it once it grows past the live table.
            if inner.cancelled.len() > inner.entries.len() + 1024 {
                inner.cancelled.clear();
            }
            inner.cancelled.insert(sequence);
            entry
        };
        entry.completion.complete(Err(MinirpcError::Cancelled))
    }

    /// Marks the table closed and resolves every entry with
    /// [`MinirpcError::Disconnected`]. Returns how many calls were failed.
    pub fn drain(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.cancelled.clear();
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };
        entries
            .into_iter()
            .filter(|entry| entry.completion.complete(Err(MinirpcError::Disconnected)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completion_first_outcome_wins() {
        let completion = Completion::new();
        assert!(completion.complete(Ok(Bytes::from_static(b"a"))));
        assert!(!completion.complete(Err(MinirpcError::Cancelled)));
        assert_eq!(completion.wait().unwrap(), Bytes::from_static(b"a"));
        assert!(completion.is_resolved());
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait())
        };
        thread::sleep(Duration::from_millis(20));
        completion.complete(Ok(Bytes::from_static(b"reply")));
        assert_eq!(waiter.join().unwrap().unwrap(), Bytes::from_static(b"reply"));
    }

    #[test]
    fn test_completion_wait_timeout() {
        let completion = Completion::new();
        assert!(completion.wait_timeout(Duration::from_millis(10)).is_none());
        completion.complete(Err(MinirpcError::Disconnected));
        assert!(matches!(
            completion.wait_timeout(Duration::from_millis(10)),
            Some(Err(MinirpcError::Disconnected))
        ));
    }

    #[test]
    fn test_sequences_start_at_one_and_skip_in_flight() {
        let table = PendingTable::new();
        let (first, _) = table.register(3, 16).unwrap();
        assert_eq!(first, 1);
        assert_eq!(table.next_sequence(), 2);

        table.inner.lock().next_sequence = 1;
        let (second, _) = table.register(3, 16).unwrap();
        assert_eq!(second, 2);
    }

    #[test]
    fn test_sequence_wraps() {
        let table = PendingTable::new();
        table.inner.lock().next_sequence = u32::MAX;
        assert_eq!(table.next_sequence(), u32::MAX);
        assert_eq!(table.next_sequence(), 0);
    }

    #[test]
    fn test_wrapped_sequence_skips_cancelled_call() {
        let table = PendingTable::new();
        let (cancelled, _) = table.register(3, 16).unwrap();
        assert!(table.cancel(cancelled));

        // wrap around onto the cancelled call's number
        table.inner.lock().next_sequence = cancelled;
        let (fresh, completion) = table.register(4, 16).unwrap();
        assert_ne!(fresh, cancelled);

        // the old call's late reply is still recognised and discarded
        assert!(matches!(table.resolve(cancelled), Resolution::Cancelled));
        assert!(!completion.is_resolved());
        match table.resolve(fresh) {
            Resolution::Pending(entry) => assert_eq!(entry.command, 4),
            _ => panic!("expected the fresh call"),
        }
    }

    #[test]
    fn test_resolve_kinds() {
        let table = PendingTable::new();
        let (live, _) = table.register(3, 16).unwrap();
        let (gone, _) = table.register(3, 16).unwrap();
        assert!(table.cancel(gone));

        match table.resolve(live) {
            Resolution::Pending(entry) => assert_eq!(entry.command, 3),
            _ => panic!("expected a pending entry"),
        }
        assert!(matches!(table.resolve(gone), Resolution::Cancelled));
        assert!(matches!(table.resolve(gone), Resolution::Unknown));
        assert!(matches!(table.resolve(999), Resolution::Unknown));
    }

    #[test]
    fn test_cancel_wakes_with_cancelled() {
        let table = PendingTable::new();
        let (sequence, completion) = table.register(1, 16).unwrap();
        assert!(table.cancel(sequence));
        assert!(!table.cancel(sequence));
        assert!(matches!(completion.wait(), Err(MinirpcError::Cancelled)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_fails_everything_once() {
        let table = PendingTable::new();
        let completions: Vec<_> = (0..5).map(|_| table.register(1, 16).unwrap().1).collect();

        assert_eq!(table.drain(), 5);
        assert_eq!(table.drain(), 0);
        for completion in completions {
            assert!(matches!(completion.wait(), Err(MinirpcError::Disconnected)));
        }
        assert!(matches!(table.register(1, 16), Err(MinirpcError::Disconnected)));
        assert!(table.is_closed());
    }

    #[test]
    fn test_register_respects_limit() {
        let table = PendingTable::new();
        table.register(1, 2).unwrap();
        table.register(1, 2).unwrap();
        assert!(matches!(
            table.register(1, 2),
            Err(MinirpcError::InvalidArgument(_))
        ));
    }
}
