//! The buffer between the reader and the sender: an unbounded
//! lock-free queue of records. Internally a most-recently-pushed
//! first linked chain behind a single atomic head pointer; a drain
//! detaches the whole chain with one atomic swap and reverses it back
//! into producer order. The reversal is part of this module's
//! contract, callers always see FIFO.

use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

/// One log line: owned, immutable bytes without the terminator. The
/// length rides along in the allocation, nothing ever re-scans for
/// terminators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    bytes: Box<[u8]>,
}

impl Record {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Self {
        Record {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

struct Node {
    record: Record,
    next: *mut Node,
}

pub struct RecordQueue {
    head: AtomicPtr<Node>,
}

// The raw node pointers are only ever exchanged through `head`
// atomically; a node reachable from `head` is owned by whoever
// detaches it.
unsafe impl Send for RecordQueue {}
unsafe impl Sync for RecordQueue {}

impl RecordQueue {
    pub fn new() -> Self {
        RecordQueue {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Prepend `record`. Lock-free: a compare-exchange loop on the
    /// head pointer, never a blocking section.
    pub fn push(&self, record: Record) {
        let node = Box::into_raw(Box::new(Node {
            record,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Atomically detach everything queued so far and return it in
    /// push order. Returns an empty Vec (and is a no-op) when nothing
    /// is queued; never blocks. Records pushed concurrently with the
    /// swap land on the fresh head and are seen by the next drain.
    pub fn drain_all_ordered(&self) -> Vec<Record> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut records = Vec::new();
        while !node.is_null() {
            let boxed = unsafe { Box::from_raw(node) };
            records.push(boxed.record);
            node = boxed.next;
        }
        // The chain is newest-first; give the caller producer order.
        records.reverse();
        records
    }
}

impl Default for RecordQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecordQueue {
    fn drop(&mut self) {
        // Free whatever never got drained.
        drop(self.drain_all_ordered());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(s: &str) -> Record {
        Record::from(s.as_bytes().to_vec())
    }

    #[test]
    fn t_drain_restores_push_order() {
        let q = RecordQueue::new();
        q.push(record("a"));
        q.push(record("b"));
        q.push(record("c"));
        assert_eq!(
            q.drain_all_ordered(),
            vec![record("a"), record("b"), record("c")]
        );
    }

    #[test]
    fn t_empty_drain_is_a_noop() {
        let q = RecordQueue::new();
        assert_eq!(q.drain_all_ordered(), Vec::<Record>::new());
        assert_eq!(q.drain_all_ordered(), Vec::<Record>::new());
    }

    #[test]
    fn t_interleaved_drains_concatenate_in_order() {
        let q = RecordQueue::new();
        let mut seen = Vec::new();
        let mut expected = Vec::new();
        for (i, chunk) in [1usize, 0, 3, 2, 5].iter().enumerate() {
            for j in 0..*chunk {
                let r = record(&format!("{i}/{j}"));
                expected.push(r.clone());
                q.push(r);
            }
            seen.extend(q.drain_all_ordered());
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn t_concurrent_producer_consumer_keeps_fifo() {
        const N: usize = 10_000;
        let q = Arc::new(RecordQueue::new());
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                for i in 0..N {
                    q.push(Record::from(i.to_ne_bytes().to_vec()));
                }
            })
        };
        let mut seen = Vec::new();
        while seen.len() < N {
            seen.extend(q.drain_all_ordered());
        }
        producer.join().expect("producer");
        assert_eq!(q.drain_all_ordered(), Vec::<Record>::new());
        for (i, r) in seen.iter().enumerate() {
            assert_eq!(r.as_bytes(), &i.to_ne_bytes()[..]);
        }
    }
}
