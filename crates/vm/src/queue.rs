use crate::error::QueueError;
use parking_lot::{Condvar, Mutex};

/// Fixed-capacity blocking FIFO shared between threads.
///
/// Used for each core's decoded-instruction stream (one producer, one consumer)
/// and for the supervisor's request stream (many producers, one consumer).
/// - `push` blocks while full, `pop` blocks while empty
/// - `close` cancels the queue: pending items are dropped and every blocked
///   caller wakes up
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    fn put(&mut self, item: T) {
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;
    }

    fn take(&mut self) -> Option<T> {
        let item = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;
        Some(item)
    }

    fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }

        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Ok(Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Insert at the tail, waiting for a free slot.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let mut ring = self.ring.lock();
        while ring.is_full() && !ring.closed {
            self.not_full.wait(&mut ring);
        }
        if ring.closed {
            return Err(QueueError::Closed);
        }

        ring.put(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove from the head, waiting for an item. `None` once closed.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        while ring.count == 0 && !ring.closed {
            self.not_empty.wait(&mut ring);
        }
        if ring.closed {
            return None;
        }

        let item = ring.take();
        drop(ring);
        self.not_full.notify_one();
        item
    }

    /// Non-blocking push; hands the item back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), (T, QueueError)> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return Err((item, QueueError::Closed));
        }
        if ring.is_full() {
            return Err((item, QueueError::Full));
        }

        ring.put(item);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return None;
        }

        let item = ring.take();
        drop(ring);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Cancel the queue. Idempotent.
    pub fn close(&self) {
        let mut ring = self.ring.lock();
        if ring.closed {
            return;
        }
        ring.closed = true;
        // Dropping queued request tickets disconnects their requesters.
        ring.clear();
        drop(ring);

        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }
}
