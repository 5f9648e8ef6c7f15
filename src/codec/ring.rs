//! Datagram container ring
//!
//! A bounded pool of fixed-size datagram buffers handed between the
//! encoder and the sender. Each container moves through
//! `Empty -> Writing -> ReadyToRead -> Reading -> Empty`; the state field
//! is the handoff token. The writer never clobbers a container that is
//! being read, and when it catches up with unread data the oldest
//! datagram is dropped first.
//!
//! Buffers are moved out of the pool while leased, so the writer and the
//! reader can fill and drain containers without holding the ring lock.

use std::sync::Mutex;

use tracing::debug;

/// Lifecycle state of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Empty,
    Writing,
    ReadyToRead,
    Reading,
}

/// Callbacks fired by the ring. All of them must be cheap: they run on
/// the encoder thread.
#[derive(Default)]
pub struct RingHooks {
    /// A container has become ready to read; argument is its index.
    pub ready: Option<Box<dyn Fn(usize) + Send + Sync>>,
    /// A run of overflows has begun.
    pub overflow_start: Option<Box<dyn Fn() + Send + Sync>>,
    /// A run of overflows has ended; argument is the number of datagrams
    /// dropped since the previous stop.
    pub overflow_stop: Option<Box<dyn Fn(u32) + Send + Sync>>,
}

struct Slot {
    state: ContainerState,
    /// Present unless leased out to the writer or the reader.
    buf: Option<Box<[u8]>>,
    /// Valid bytes in the buffer once ready to read.
    len: usize,
}

struct Inner {
    slots: Vec<Slot>,
    next_write: usize,
    next_read: usize,
    free: usize,
    min_free: usize,
    /// Overflows in the current run; non-zero means a run is open.
    overflow_run: u32,
    total_overflows: u64,
}

/// A container leased for writing. Must be returned via
/// [`DatagramRing::finish_write`].
pub struct WriteLease {
    pub index: usize,
    pub buf: Box<[u8]>,
}

/// A container leased for reading. Return via
/// [`DatagramRing::finish_read`] on success or
/// [`DatagramRing::abort_read`] to keep it for a retry.
pub struct ReadLease {
    pub index: usize,
    pub buf: Box<[u8]>,
    pub len: usize,
}

/// The container pool.
pub struct DatagramRing {
    inner: Mutex<Inner>,
    capacity: usize,
    datagram_size: usize,
    hooks: RingHooks,
}

enum OverflowEvent {
    None,
    Started,
    Stopped(u32),
}

impl DatagramRing {
    pub fn new(capacity: usize, datagram_size: usize, hooks: RingHooks) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: ContainerState::Empty,
                buf: Some(vec![0u8; datagram_size].into_boxed_slice()),
                len: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                slots,
                next_write: 0,
                next_read: 0,
                free: capacity,
                min_free: capacity,
                overflow_run: 0,
                total_overflows: 0,
            }),
            capacity,
            datagram_size,
            hooks,
        }
    }

    /// Lease the next container for writing. Always succeeds: if the
    /// writer has caught up with unread data, the oldest datagram is
    /// dropped and an overflow is recorded. A container currently being
    /// read is skipped, never clobbered.
    pub fn begin_write(&self) -> WriteLease {
        let (lease, event) = {
            let mut inner = self.inner.lock().unwrap();
            let capacity = self.capacity;

            let mut index = inner.next_write;
            for _ in 0..capacity {
                if inner.slots[index].state == ContainerState::Reading {
                    index = (index + 1) % capacity;
                } else {
                    break;
                }
            }
            inner.next_write = (index + 1) % capacity;

            let event = match inner.slots[index].state {
                ContainerState::Empty => {
                    inner.free -= 1;
                    if inner.free < inner.min_free {
                        inner.min_free = inner.free;
                    }
                    if inner.overflow_run > 0 {
                        let count = inner.overflow_run;
                        inner.overflow_run = 0;
                        OverflowEvent::Stopped(count)
                    } else {
                        OverflowEvent::None
                    }
                }
                ContainerState::ReadyToRead => {
                    // Overwriting old data: nudge the read cursor past the
                    // dropped datagram so it cannot wrap the write cursor.
                    inner.next_read = (inner.next_read + 1) % capacity;
                    inner.total_overflows += 1;
                    let first = inner.overflow_run == 0;
                    inner.overflow_run += 1;
                    if first {
                        OverflowEvent::Started
                    } else {
                        OverflowEvent::None
                    }
                }
                other => unreachable!("write cursor found container in state {other:?}"),
            };

            let slot = &mut inner.slots[index];
            slot.state = ContainerState::Writing;
            let buf = slot.buf.take().expect("container buffer present");
            (WriteLease { index, buf }, event)
        };

        match event {
            OverflowEvent::None => {}
            OverflowEvent::Started => {
                debug!("datagram overflow begins");
                if let Some(f) = &self.hooks.overflow_start {
                    f();
                }
            }
            OverflowEvent::Stopped(count) => {
                debug!(count, "datagram overflow ends");
                if let Some(f) = &self.hooks.overflow_stop {
                    f(count);
                }
            }
        }
        lease
    }

    /// Mark a written container ready to read and fire the ready hook.
    pub fn finish_write(&self, lease: WriteLease, len: usize) {
        debug_assert!(len <= self.datagram_size);
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[lease.index];
            debug_assert_eq!(slot.state, ContainerState::Writing);
            slot.buf = Some(lease.buf);
            slot.len = len;
            slot.state = ContainerState::ReadyToRead;
        }
        if let Some(f) = &self.hooks.ready {
            f(lease.index);
        }
    }

    /// Lease the next container for reading, if one is ready. A container
    /// abandoned mid-read (send failure) is handed out again.
    pub fn begin_read(&self) -> Option<ReadLease> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.next_read;
        let slot = &mut inner.slots[index];
        match slot.state {
            ContainerState::ReadyToRead | ContainerState::Reading => {
                slot.state = ContainerState::Reading;
                let buf = slot.buf.take()?;
                Some(ReadLease {
                    index,
                    buf,
                    len: slot.len,
                })
            }
            _ => None,
        }
    }

    /// Mark a read container consumed: the read cursor moves on and the
    /// container becomes free.
    pub fn finish_read(&self, lease: ReadLease) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.slots[lease.index].state, ContainerState::Reading);
        inner.next_read = (lease.index + 1) % self.capacity;
        let slot = &mut inner.slots[lease.index];
        slot.buf = Some(lease.buf);
        slot.len = 0;
        slot.state = ContainerState::Empty;
        inner.free += 1;
    }

    /// Hand a leased container back unconsumed. It stays in the reading
    /// state so the next [`begin_read`](Self::begin_read) returns it
    /// again, e.g. after a reconnect.
    pub fn abort_read(&self, lease: ReadLease) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[lease.index];
        debug_assert_eq!(slot.state, ContainerState::Reading);
        slot.buf = Some(lease.buf);
    }

    /// Number of containers holding unread datagrams.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        self.capacity - inner.free
    }

    /// Number of empty containers.
    pub fn free(&self) -> usize {
        self.inner.lock().unwrap().free
    }

    /// Low-water mark of [`free`](Self::free) since construction.
    pub fn min_free(&self) -> usize {
        self.inner.lock().unwrap().min_free
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn datagram_size(&self) -> usize {
        self.datagram_size
    }

    /// Total datagrams dropped to overflow since construction.
    pub fn total_overflows(&self) -> u64 {
        self.inner.lock().unwrap().total_overflows
    }

    /// Check the pool accounting invariant: free + non-empty == capacity.
    #[cfg(test)]
    fn check_accounting(&self) {
        let inner = self.inner.lock().unwrap();
        let non_empty = inner
            .slots
            .iter()
            .filter(|s| s.state != ContainerState::Empty)
            .count();
        assert_eq!(inner.free + non_empty, self.capacity);
        let writing = inner
            .slots
            .iter()
            .filter(|s| s.state == ContainerState::Writing)
            .count();
        let reading = inner
            .slots
            .iter()
            .filter(|s| s.state == ContainerState::Reading)
            .count();
        assert!(writing <= 1, "more than one container in Writing");
        assert!(reading <= 1, "more than one container in Reading");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ring(capacity: usize) -> DatagramRing {
        DatagramRing::new(capacity, 8, RingHooks::default())
    }

    fn write_one(ring: &DatagramRing, tag: u8) {
        let mut lease = ring.begin_write();
        lease.buf[0] = tag;
        ring.finish_write(lease, 1);
    }

    #[test]
    fn fifo_order() {
        let ring = ring(4);
        write_one(&ring, 1);
        write_one(&ring, 2);
        assert_eq!(ring.available(), 2);

        let lease = ring.begin_read().unwrap();
        assert_eq!(lease.buf[0], 1);
        ring.finish_read(lease);

        let lease = ring.begin_read().unwrap();
        assert_eq!(lease.buf[0], 2);
        ring.finish_read(lease);

        assert!(ring.begin_read().is_none());
        assert_eq!(ring.free(), 4);
        ring.check_accounting();
    }

    #[test]
    fn aborted_read_is_handed_out_again() {
        let ring = ring(4);
        write_one(&ring, 7);

        let lease = ring.begin_read().unwrap();
        assert_eq!(lease.buf[0], 7);
        ring.abort_read(lease);

        // Still there for the retry.
        let lease = ring.begin_read().unwrap();
        assert_eq!(lease.buf[0], 7);
        ring.finish_read(lease);
        assert!(ring.begin_read().is_none());
        ring.check_accounting();
    }

    #[test]
    fn overflow_drops_oldest_first() {
        let capacity = 250;
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let hooks = RingHooks {
            ready: None,
            overflow_start: Some(Box::new({
                let started = started.clone();
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                }
            })),
            overflow_stop: Some(Box::new({
                let stopped = stopped.clone();
                move |count| {
                    stopped.store(count, Ordering::SeqCst);
                }
            })),
        };
        let ring = DatagramRing::new(capacity, 8, hooks);

        // Sender held: 251 blocks arrive. Sequence number goes in the
        // first buffer byte (it fits for this test's counts < 256).
        for sequence in 0..=250u16 {
            let mut lease = ring.begin_write();
            lease.buf[0] = (sequence & 0xFF) as u8;
            lease.buf[1] = (sequence >> 8) as u8;
            ring.finish_write(lease, 2);
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ring.total_overflows(), 1);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.min_free(), 0);
        ring.check_accounting();

        // Sender resumes: exactly 250 datagrams, monotonic, starting at
        // sequence 1 (sequence 0 was dropped).
        let mut expected = 1u16;
        while let Some(lease) = ring.begin_read() {
            let sequence = lease.buf[0] as u16 | (lease.buf[1] as u16) << 8;
            assert_eq!(sequence, expected);
            expected += 1;
            ring.finish_read(lease);
        }
        assert_eq!(expected, 251);
        assert_eq!(ring.free(), capacity);

        // The next clean write ends the overflow run with its count.
        write_one(&ring, 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        ring.check_accounting();
    }

    #[test]
    fn overflow_stop_reports_run_count() {
        let stopped = Arc::new(AtomicU32::new(0));
        let hooks = RingHooks {
            ready: None,
            overflow_start: None,
            overflow_stop: Some(Box::new({
                let stopped = stopped.clone();
                move |count| {
                    stopped.store(count, Ordering::SeqCst);
                }
            })),
        };
        let ring = DatagramRing::new(3, 8, hooks);
        for tag in 0..8 {
            write_one(&ring, tag);
        }
        // 3 fills + 5 overwrites.
        assert_eq!(ring.total_overflows(), 5);

        // Drain one, then write: the fetch finds an empty container and
        // closes the run.
        let lease = ring.begin_read().unwrap();
        ring.finish_read(lease);
        write_one(&ring, 9);
        assert_eq!(stopped.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn writer_skips_container_being_read() {
        let ring = ring(2);
        write_one(&ring, 1);
        write_one(&ring, 2);

        // Reader holds container 0.
        let held = ring.begin_read().unwrap();
        assert_eq!(held.index, 0);

        // Both further writes must land in container 1, never 0.
        let lease = ring.begin_write();
        assert_eq!(lease.index, 1);
        ring.finish_write(lease, 1);
        let lease = ring.begin_write();
        assert_eq!(lease.index, 1);
        ring.finish_write(lease, 1);

        ring.finish_read(held);
        ring.check_accounting();
    }

    #[test]
    fn ready_hook_fires_with_index() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let hooks = RingHooks {
            ready: Some(Box::new({
                let seen = seen.clone();
                move |index| {
                    seen.store(index, Ordering::SeqCst);
                }
            })),
            overflow_start: None,
            overflow_stop: None,
        };
        let ring = DatagramRing::new(4, 8, hooks);
        let lease = ring.begin_write();
        assert_eq!(seen.load(Ordering::SeqCst), usize::MAX);
        ring.finish_write(lease, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_producer_consumer_keeps_accounting() {
        let ring = Arc::new(ring(16));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for tag in 0..1000u32 {
                    write_one(&ring, (tag & 0xFF) as u8);
                }
            })
        };
        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut drained = 0usize;
                while drained < 200 {
                    match ring.begin_read() {
                        Some(lease) => {
                            ring.finish_read(lease);
                            drained += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
        ring.check_accounting();
    }
}
