//! A bounded multi-producer multi-consumer channel for fibers.
//!
//! [`channel`] returns a [`Sender`]/[`Receiver`] pair sharing a buffer of
//! fixed capacity. Both halves are reference-counted: cloning adds a
//! producer or consumer, and dropping the last one disconnects the channel.
//! A capacity of zero makes the channel a rendezvous point where every send
//! waits for a matching receive.
//!
//! [`Sender::send`] and [`Receiver::recv`] return promises, so a full or
//! empty channel never blocks the thread; the caller decides when to wait.
//! Values travel strictly FIFO, and so do waiting senders and receivers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};

use crate::error::Error;
use crate::promise::{Promise, Resolver};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct Channel<T: Clone + Send + 'static> {
    state: SyncMutex<ChanState<T>>,
}

struct ChanState<T: Clone + Send + 'static> {
    capacity: usize,
    buffer: VecDeque<T>,
    send_waiters: VecDeque<SendWaiter<T>>,
    recv_waiters: VecDeque<RecvWaiter<T>>,
    next_waiter: u64,
    tx_count: usize,
    rx_count: usize,
}

struct SendWaiter<T: Clone + Send + 'static> {
    id: u64,
    value: T,
    resolver: Resolver<()>,
    /// The send promise handed to the producer; a cancelled sender gives up
    /// its slot together with its value.
    sent: Promise<()>,
}

struct RecvWaiter<T: Clone + Send + 'static> {
    id: u64,
    resolver: Resolver<T>,
    received: Promise<T>,
}

impl<T: Clone + Send + 'static> Channel<T> {
    fn lock_state(&self) -> MutexGuard<'_, ChanState<T>> {
        self.state.lock().expect("channel state lock poisoned")
    }
}

impl<T: Clone + Send + 'static> ChanState<T> {
    /// Pops the next receiver whose promise is still live.
    fn next_receiver(&mut self) -> Option<RecvWaiter<T>> {
        loop {
            match self.recv_waiters.pop_front() {
                Some(w) if w.received.is_cancelled() => continue,
                other => return other,
            }
        }
    }

    /// Pops the next queued sender whose promise is still live.
    fn next_sender(&mut self) -> Option<SendWaiter<T>> {
        loop {
            match self.send_waiters.pop_front() {
                Some(w) if w.sent.is_cancelled() => continue,
                other => return other,
            }
        }
    }
}

/// Creates a bounded channel and returns its first sender and receiver.
///
/// `capacity` values can sit in the buffer before senders start waiting;
/// zero means rendezvous.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>)
where
    T: Clone + Send + 'static,
{
    let chan = Arc::new(Channel {
        state: SyncMutex::new(ChanState {
            capacity,
            buffer: VecDeque::new(),
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            next_waiter: 0,
            tx_count: 1,
            rx_count: 1,
        }),
    });
    (
        Sender {
            chan: Arc::clone(&chan),
        },
        Receiver { chan },
    )
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

/// The producing half of a [`channel`]. Cloning adds a producer; dropping
/// the last one disconnects the channel for the receivers.
pub struct Sender<T: Clone + Send + 'static> {
    chan: Arc<Channel<T>>,
}

impl<T> Sender<T>
where
    T: Clone + Send + 'static,
{
    /// Sends a value. The returned promise resolves once the value has been
    /// accepted: immediately when a receiver is waiting or the buffer has
    /// room, otherwise when enough receives have drained the channel.
    ///
    /// Fails with [`Error::Disconnected`] when no receiver is left.
    /// Cancelling a pending send withdraws the value.
    pub fn send(&self, value: T) -> Promise<()> {
        let mut st = self.chan.lock_state();
        if st.rx_count == 0 {
            return Promise::rejected(Error::Disconnected);
        }
        if let Some(receiver) = st.next_receiver() {
            drop(st);
            receiver.resolver.resolve(value);
            return Promise::resolved(());
        }
        if st.buffer.len() < st.capacity {
            st.buffer.push_back(value);
            return Promise::resolved(());
        }
        let (promise, resolver) = Promise::pending();
        st.next_waiter += 1;
        let id = st.next_waiter;
        st.send_waiters.push_back(SendWaiter {
            id,
            value,
            resolver,
            sent: promise.clone(),
        });
        drop(st);
        let chan = Arc::downgrade(&self.chan);
        promise.on_cancel(move || {
            if let Some(chan) = chan.upgrade() {
                chan.lock_state().send_waiters.retain(|w| w.id != id);
            }
        });
        promise
    }

    /// Non-waiting send: accepts the value only if a receiver is waiting or
    /// the buffer has room, otherwise hands it back.
    pub fn try_send(&self, value: T) -> StdResult<(), TrySendError<T>> {
        let mut st = self.chan.lock_state();
        if st.rx_count == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        if let Some(receiver) = st.next_receiver() {
            drop(st);
            receiver.resolver.resolve(value);
            return Ok(());
        }
        if st.buffer.len() < st.capacity {
            st.buffer.push_back(value);
            Ok(())
        } else {
            Err(TrySendError::Full(value))
        }
    }

    /// Returns `true` if every [`Receiver`] handle has been dropped, which
    /// means any further send will fail.
    pub fn is_closed(&self) -> bool {
        self.chan.lock_state().rx_count == 0
    }
}

impl<T: Clone + Send + 'static> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.lock_state().tx_count += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        let orphans = {
            let mut st = self.chan.lock_state();
            st.tx_count -= 1;
            if st.tx_count == 0 {
                std::mem::take(&mut st.recv_waiters)
            } else {
                VecDeque::new()
            }
        };
        // The last sender is gone: nothing will ever arrive for the parked
        // receivers.
        for waiter in orphans {
            waiter.resolver.reject(Error::Disconnected);
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Disconnected(v) => v,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

/// The consuming half of a [`channel`]. Cloning adds a consumer; dropping
/// the last one disconnects the channel for the senders.
pub struct Receiver<T: Clone + Send + 'static> {
    chan: Arc<Channel<T>>,
}

impl<T> Receiver<T>
where
    T: Clone + Send + 'static,
{
    /// Receives the next value. The returned promise resolves immediately
    /// when the buffer holds a value or a sender is waiting, otherwise once
    /// a send arrives.
    ///
    /// Fails with [`Error::Disconnected`] when every sender is gone and the
    /// buffer is drained. Buffered values are still delivered after the
    /// senders disconnect.
    pub fn recv(&self) -> Promise<T> {
        let mut st = self.chan.lock_state();
        if let Some(value) = st.buffer.pop_front() {
            // A freed buffer slot admits the longest-waiting sender.
            if let Some(waiter) = st.next_sender() {
                st.buffer.push_back(waiter.value);
                drop(st);
                waiter.resolver.resolve(());
            }
            return Promise::resolved(value);
        }
        if let Some(waiter) = st.next_sender() {
            // Rendezvous: take straight from the sender's hand.
            drop(st);
            let SendWaiter { value, resolver, .. } = waiter;
            resolver.resolve(());
            return Promise::resolved(value);
        }
        if st.tx_count == 0 {
            return Promise::rejected(Error::Disconnected);
        }
        let (promise, resolver) = Promise::pending();
        st.next_waiter += 1;
        let id = st.next_waiter;
        st.recv_waiters.push_back(RecvWaiter {
            id,
            resolver,
            received: promise.clone(),
        });
        drop(st);
        let chan = Arc::downgrade(&self.chan);
        promise.on_cancel(move || {
            if let Some(chan) = chan.upgrade() {
                chan.lock_state().recv_waiters.retain(|w| w.id != id);
            }
        });
        promise
    }

    /// Non-waiting receive.
    pub fn try_recv(&self) -> StdResult<T, TryRecvError> {
        let mut st = self.chan.lock_state();
        if let Some(value) = st.buffer.pop_front() {
            if let Some(waiter) = st.next_sender() {
                st.buffer.push_back(waiter.value);
                drop(st);
                waiter.resolver.resolve(());
            }
            return Ok(value);
        }
        if let Some(waiter) = st.next_sender() {
            drop(st);
            let SendWaiter { value, resolver, .. } = waiter;
            resolver.resolve(());
            return Ok(value);
        }
        if st.tx_count == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.chan.lock_state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.lock_state().buffer.is_empty()
    }

    /// Returns `true` if every [`Sender`] handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.chan.lock_state().tx_count == 0
    }
}

impl<T: Clone + Send + 'static> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.lock_state().rx_count += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        let orphans = {
            let mut st = self.chan.lock_state();
            st.rx_count -= 1;
            if st.rx_count == 0 {
                std::mem::take(&mut st.send_waiters)
            } else {
                VecDeque::new()
            }
        };
        // The last receiver is gone: the queued values can never be taken.
        for waiter in orphans {
            waiter.resolver.reject(Error::Disconnected);
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::timer::delay;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};
    use std::time::Duration;

    #[test]
    fn buffered_send_and_recv_do_not_wait() {
        let (tx, rx) = channel(2);
        assert!(tx.send(1).is_fulfilled());
        assert!(tx.send(2).is_fulfilled());
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv().wait().unwrap(), 1);
        assert_eq!(rx.recv().wait().unwrap(), 2);
        assert!(rx.is_empty());
    }

    #[test]
    fn full_buffer_applies_backpressure() {
        let (tx, rx) = channel(1);
        assert!(tx.send(10).is_fulfilled());
        let second = tx.send(20);
        assert!(second.is_pending());
        assert_eq!(rx.recv().wait().unwrap(), 10);
        // The freed slot admitted the queued send.
        assert!(second.is_fulfilled());
        assert_eq!(rx.recv().wait().unwrap(), 20);
    }

    #[test]
    fn recv_waits_for_a_send_from_a_fiber() {
        let (tx, rx) = channel(1);
        let consumer = fiber::spawn(move || rx.recv().wait());
        delay(Duration::from_millis(5))
            .then(move |_| {
                tx.send(77);
                Ok(())
            })
            .wait()
            .unwrap();
        assert_eq!(consumer.wait().unwrap(), 77);
    }

    #[test]
    fn rendezvous_channel_pairs_sends_with_receives() {
        let (tx, rx) = channel(0);
        let pending = tx.send(5);
        assert!(pending.is_pending());
        assert_eq!(rx.recv().wait().unwrap(), 5);
        assert!(pending.is_fulfilled());
    }

    #[test]
    fn values_and_receivers_are_fifo() {
        let (tx, rx) = channel(0);
        let got = StdArc::new(StdMutex::new(Vec::new()));
        let mut consumers = Vec::new();
        for i in 0..3usize {
            let rx = rx.clone();
            let got = StdArc::clone(&got);
            consumers.push(fiber::spawn(move || {
                let v = rx.recv().wait()?;
                got.lock().unwrap().push((i, v));
                Ok(())
            }));
        }
        // Let all three consumers park first.
        delay(Duration::from_millis(5)).wait().unwrap();
        for v in [100, 200, 300] {
            tx.send(v).wait().unwrap();
        }
        for c in consumers {
            c.wait().unwrap();
        }
        assert_eq!(*got.lock().unwrap(), vec![(0, 100), (1, 200), (2, 300)]);
    }

    #[test]
    fn dropping_all_senders_disconnects_after_the_buffer_drains() {
        let (tx, rx) = channel(2);
        tx.send(1).wait().unwrap();
        drop(tx);
        assert!(rx.is_closed());
        assert_eq!(rx.recv().wait().unwrap(), 1);
        let err = rx.recv().wait().unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[test]
    fn dropping_all_senders_wakes_parked_receivers() {
        let (tx, rx) = channel::<i32>(1);
        let consumer = fiber::spawn(move || rx.recv().wait());
        delay(Duration::from_millis(5))
            .then(move |_| {
                drop(tx);
                Ok(())
            })
            .wait()
            .unwrap();
        assert!(matches!(consumer.wait().unwrap_err(), Error::Disconnected));
    }

    #[test]
    fn dropping_all_receivers_rejects_queued_sends() {
        let (tx, rx) = channel(0);
        let stuck = tx.send(9);
        assert!(stuck.is_pending());
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(stuck.wait().unwrap_err(), Error::Disconnected));
        assert!(matches!(
            tx.send(10).wait().unwrap_err(),
            Error::Disconnected
        ));
    }

    #[test]
    fn try_send_and_try_recv_report_capacity_and_disconnection() {
        let (tx, rx) = channel(1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert!(tx.try_send(1).is_ok());
        assert_eq!(tx.try_send(2), Err(TrySendError::Full(2)));
        assert_eq!(rx.try_recv(), Ok(1));
        drop(tx);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));

        let (tx, rx) = channel(1);
        drop(rx);
        assert_eq!(tx.try_send(3), Err(TrySendError::Disconnected(3)));
    }

    #[test]
    fn cancelled_send_withdraws_its_value() {
        let (tx, rx) = channel(0);
        let withdrawn = tx.send(1);
        let kept = tx.send(2);
        withdrawn.cancel();
        assert_eq!(rx.recv().wait().unwrap(), 2);
        assert!(kept.is_fulfilled());
    }

    #[test]
    fn cancelled_receiver_is_skipped() {
        let (tx, rx) = channel(0);
        let gone = rx.recv();
        let live = rx.recv();
        gone.cancel();
        tx.send(4).wait().unwrap();
        assert_eq!(live.wait().unwrap(), 4);
        assert!(gone.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn clones_keep_the_channel_open() {
        let (tx, rx) = channel(1);
        let tx2 = tx.clone();
        drop(tx);
        assert!(!rx.is_closed());
        tx2.send(8).wait().unwrap();
        assert_eq!(rx.recv().wait().unwrap(), 8);
        drop(tx2);
        assert!(rx.is_closed());
    }
}
