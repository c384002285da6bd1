//! Fixed-capacity ring buffers with monotonic head/tail counters.
//!
//! Two faces over the same wraparound arithmetic: `ByteRing` for the shared
//! log sink (overflow advances the tail and counts every lost byte) and
//! `SlotRing` for typed sample history. Indices are monotonic u64 counters;
//! the physical position is always `index % capacity`, so lost-byte
//! accounting stays exact across arbitrarily many wraps.

/// Byte-oriented ring. Writers never fail: when full, the oldest bytes are
/// overwritten and `bytes_lost` is advanced by the same amount.
#[derive(Debug)]
pub struct ByteRing {
    buf: Vec<u8>,
    head: u64,
    tail: u64,
    bytes_lost: u64,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: vec![0; capacity],
            head: 0,
            tail: 0,
            bytes_lost: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently readable.
    pub fn len(&self) -> usize {
        (self.head - self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Total bytes dropped to make room since construction.
    pub fn bytes_lost(&self) -> u64 {
        self.bytes_lost
    }

    pub fn push(&mut self, data: &[u8]) {
        let cap = self.buf.len() as u64;
        for &byte in data {
            // Advance the tail before the head catches it, so the read
            // window never contains a half-overwritten byte.
            if self.head - self.tail >= cap {
                self.tail += 1;
                self.bytes_lost += 1;
            }
            let pos = (self.head % cap) as usize;
            self.buf[pos] = byte;
            self.head += 1;
        }
    }

    /// Copy of everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        let cap = self.buf.len() as u64;
        let mut out = Vec::with_capacity(self.len());
        let mut idx = self.tail;
        while idx < self.head {
            out.push(self.buf[(idx % cap) as usize]);
            idx += 1;
        }
        out
    }

    /// Drain the readable window, returning it together with the number of
    /// bytes lost to overflow since the previous drain.
    pub fn drain(&mut self) -> (Vec<u8>, u64) {
        let data = self.snapshot();
        let lost = self.bytes_lost;
        self.tail = self.head;
        self.bytes_lost = 0;
        (data, lost)
    }

    pub fn clear(&mut self) {
        self.tail = self.head;
        self.bytes_lost = 0;
    }
}

/// Typed slot ring: keeps the most recent `capacity` items.
#[derive(Debug)]
pub struct SlotRing<T> {
    slots: Vec<Option<T>>,
    head: usize,
    count: usize,
}

impl<T: Clone> SlotRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            slots: vec![None; capacity],
            head: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, item: T) {
        let cap = self.slots.len();
        self.slots[self.head] = Some(item);
        self.head = (self.head + 1) % cap;
        if self.count < cap {
            self.count += 1;
        }
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let cap = self.slots.len();
        let start = (self.head + cap - self.count) % cap;
        (0..self.count).filter_map(move |i| self.slots[(start + i) % cap].as_ref())
    }

    pub fn latest(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        let cap = self.slots.len();
        self.slots[(self.head + cap - 1) % cap].as_ref()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.count = 0;
    }
}
