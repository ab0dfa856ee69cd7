//! Bounded FIFO channels
//!
//! CSP-style communication between tasks. Blocking is cooperative: a waiter
//! loops on the channel state and yields to the May scheduler between
//! checks, so the single worker thread keeps making progress elsewhere.
//!
//! Fairness: each direction hands out monotonically increasing tickets and
//! serves them in order, so sends and receives are FIFO per channel per
//! direction even with many blocked tasks.
//!
//! Capacity 0 is a rendezvous: at most one value is in flight and the
//! sender does not complete until a receiver has taken it.

use crate::value::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Send on a closed channel, or receive after the queue drained
    Closed,
    /// The waiting task was cancelled at this suspension point
    Cancelled,
}

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
    abandoned: HashSet<u64>,
}

impl Tickets {
    fn take(&mut self) -> u64 {
        let t = self.next;
        self.next += 1;
        t
    }

    fn is_turn(&self, ticket: u64) -> bool {
        self.serving == ticket
    }

    /// Complete the currently served ticket and skip any abandoned ones
    fn advance(&mut self) {
        self.serving += 1;
        while self.abandoned.remove(&self.serving) {
            self.serving += 1;
        }
    }

    /// Give up a ticket that may or may not be currently served
    fn abandon(&mut self, ticket: u64) {
        if self.serving == ticket {
            self.advance();
        } else {
            self.abandoned.insert(ticket);
        }
    }
}

#[derive(Debug, Default)]
struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    /// Count of values ever pushed / ever popped; a rendezvous sender is
    /// complete once `taken` reaches its push sequence number.
    pushed: u64,
    taken: u64,
    send: Tickets,
    recv: Tickets,
}

/// A channel cell. Shared by `Rc`; duplicating the value shares the queue.
#[derive(Debug)]
pub struct ChannelCell {
    pub id: u64,
    pub capacity: usize,
    state: Mutex<ChanState>,
}

impl ChannelCell {
    pub fn new(capacity: usize) -> std::rc::Rc<Self> {
        std::rc::Rc::new(ChannelCell {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            state: Mutex::new(ChanState::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("channel lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("channel lock").closed
    }

    /// Close the channel. Blocked senders fail; receivers drain the queue
    /// and then fail. Waiters notice on their next poll.
    pub fn close(&self) {
        self.state.lock().expect("channel lock").closed = true;
    }

    /// Send a value, cooperatively blocking while the channel is full (or,
    /// for a rendezvous channel, until a receiver takes the value).
    /// `cancelled` is polled at every suspension; a true result abandons
    /// the wait.
    pub fn send(&self, value: Value, cancelled: &dyn Fn() -> bool) -> Result<(), ChannelError> {
        let ticket = self.state.lock().expect("channel lock").send.take();
        let mut pending = Some(value);
        let my_seq;
        loop {
            {
                let mut state = self.state.lock().expect("channel lock");
                if state.closed {
                    state.send.abandon(ticket);
                    return Err(ChannelError::Closed);
                }
                if cancelled() {
                    state.send.abandon(ticket);
                    return Err(ChannelError::Cancelled);
                }
                if state.send.is_turn(ticket) {
                    let has_room = if self.capacity == 0 {
                        state.queue.is_empty()
                    } else {
                        state.queue.len() < self.capacity
                    };
                    if has_room {
                        state.queue.push_back(pending.take().expect("value pending"));
                        state.pushed += 1;
                        my_seq = state.pushed;
                        state.send.advance();
                        break;
                    }
                }
            }
            may::coroutine::yield_now();
        }
        if self.capacity > 0 {
            return Ok(());
        }
        // Rendezvous: completion means the receiver took our value.
        loop {
            {
                let mut state = self.state.lock().expect("channel lock");
                if state.taken >= my_seq {
                    return Ok(());
                }
                if state.closed {
                    return Err(ChannelError::Closed);
                }
                if cancelled() {
                    // Retract if still queued (ours is the only in-flight
                    // value on a rendezvous channel).
                    state.queue.pop_front();
                    state.pushed -= 1;
                    return Err(ChannelError::Cancelled);
                }
            }
            may::coroutine::yield_now();
        }
    }

    /// Receive a value, cooperatively blocking while the queue is empty.
    /// A closed channel drains its queue, then fails.
    pub fn recv(&self, cancelled: &dyn Fn() -> bool) -> Result<Value, ChannelError> {
        self.recv_inner(None, cancelled)
            .map(|v| v.expect("no deadline implies a value"))
    }

    /// Receive with a timeout; `Ok(None)` on expiry.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<Value>, ChannelError> {
        self.recv_inner(Some(Instant::now() + timeout), cancelled)
    }

    fn recv_inner(
        &self,
        deadline: Option<Instant>,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Option<Value>, ChannelError> {
        let ticket = self.state.lock().expect("channel lock").recv.take();
        loop {
            {
                let mut state = self.state.lock().expect("channel lock");
                if state.recv.is_turn(ticket) {
                    if let Some(value) = state.queue.pop_front() {
                        state.taken += 1;
                        state.recv.advance();
                        return Ok(Some(value));
                    }
                    if state.closed {
                        state.recv.advance();
                        return Err(ChannelError::Closed);
                    }
                }
                if cancelled() {
                    state.recv.abandon(ticket);
                    return Err(ChannelError::Cancelled);
                }
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    state.recv.abandon(ticket);
                    return Ok(None);
                }
            }
            if deadline.is_some() {
                may::coroutine::sleep(Duration::from_micros(500));
            } else {
                may::coroutine::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never() -> bool {
        false
    }

    #[test]
    fn test_buffered_send_recv_fifo() {
        let chan = ChannelCell::new(4);
        chan.send(Value::I32(1), &never).unwrap();
        chan.send(Value::I32(2), &never).unwrap();
        assert_eq!(chan.len(), 2);
        assert!(matches!(chan.recv(&never), Ok(Value::I32(1))));
        assert!(matches!(chan.recv(&never), Ok(Value::I32(2))));
    }

    #[test]
    fn test_closed_channel_drains_then_fails() {
        let chan = ChannelCell::new(4);
        chan.send(Value::I32(1), &never).unwrap();
        chan.close();
        assert_eq!(chan.send(Value::I32(2), &never), Err(ChannelError::Closed));
        assert!(matches!(chan.recv(&never), Ok(Value::I32(1))));
        assert!(matches!(chan.recv(&never), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let chan = ChannelCell::new(1);
        let got = chan
            .recv_timeout(Duration::from_millis(5), &never)
            .expect("timeout is not an error");
        assert!(got.is_none());
    }

    #[test]
    fn test_cancel_observed_while_blocked() {
        let chan = ChannelCell::new(1);
        assert!(matches!(chan.recv(&|| true), Err(ChannelError::Cancelled)));
        chan.send(Value::I32(1), &never).unwrap();
        // Full channel: the second send blocks and sees the cancel.
        assert!(matches!(
            chan.send(Value::I32(2), &|| true),
            Err(ChannelError::Cancelled)
        ));
    }

    #[test]
    fn test_ticket_fairness_bookkeeping() {
        let mut tickets = Tickets::default();
        let a = tickets.take();
        let b = tickets.take();
        let c = tickets.take();
        assert!(tickets.is_turn(a));
        // b abandons while not served; serving skips straight from a to c.
        tickets.abandon(b);
        tickets.advance();
        assert!(tickets.is_turn(c));
    }

    #[test]
    fn test_rendezvous_across_coroutines() {
        // Single worker so the exchange is strictly cooperative.
        may::config().set_workers(1);
        let pair = std::thread::spawn(|| {
            let chan = std::sync::Arc::new(RawChan::new());
            let sender = chan.clone();
            let handle = unsafe {
                may::coroutine::spawn(move || {
                    sender.0.send(Value::I32(42), &|| false).unwrap();
                })
            };
            let receiver = chan.clone();
            let got = unsafe {
                may::coroutine::spawn(move || {
                    match receiver.0.recv(&|| false).unwrap() {
                        Value::I32(v) => v,
                        other => panic!("unexpected value {:?}", other),
                    }
                })
            };
            let value = got.join().unwrap();
            handle.join().unwrap();
            value
        })
        .join()
        .unwrap();
        assert_eq!(pair, 42);
    }

    /// Test-only wrapper asserting the single-worker transfer is safe
    struct RawChan(ChannelCell);
    unsafe impl Send for RawChan {}
    unsafe impl Sync for RawChan {}
    impl RawChan {
        fn new() -> Self {
            RawChan(ChannelCell {
                id: 0,
                capacity: 0,
                state: Mutex::new(ChanState::default()),
            })
        }
    }
}
