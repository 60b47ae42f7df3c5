use std::sync::{Mutex, PoisonError};

use crate::error::{Result, SessionError};

/// Hands out stream ids that are unique among in-flight requests.
///
/// Ids come from an inclusive range (default `1..=65535`; `0` is the wire's
/// "no id" value). Scanning resumes after the last id handed out, so a freshly
/// released id is the last to be reused. One allocator belongs to one
/// connection.
#[derive(Debug)]
pub struct StreamIdAllocator {
    lo: u16,
    capacity: usize,
    state: Mutex<AllocState>,
}

#[derive(Debug)]
struct AllocState {
    bits: Vec<u64>,
    in_use: usize,
    cursor: usize,
}

impl AllocState {
    fn is_set(&self, index: usize) -> bool {
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.bits[index / 64] &= !(1 << (index % 64));
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self::with_range(1, u16::MAX)
    }

    /// Allocator over `lo..=hi`.
    ///
    /// # Panics
    ///
    /// Panics if `lo` is zero or greater than `hi`.
    pub fn with_range(lo: u16, hi: u16) -> Self {
        assert!(lo >= 1, "stream id 0 is reserved for \"no id\"");
        assert!(lo <= hi, "empty stream id range {lo}..={hi}");

        let capacity = usize::from(hi - lo) + 1;
        Self {
            lo,
            capacity,
            state: Mutex::new(AllocState {
                bits: vec![0; capacity.div_ceil(64)],
                in_use: 0,
                cursor: 0,
            }),
        }
    }

    /// Reserve the next free id.
    pub fn alloc(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_use == self.capacity {
            return Err(SessionError::IdsExhausted(state.in_use));
        }

        for step in 0..self.capacity {
            let index = (state.cursor + step) % self.capacity;
            if !state.is_set(index) {
                state.set(index);
                state.in_use += 1;
                state.cursor = (index + 1) % self.capacity;
                // index < capacity <= u16 range above lo
                return Ok(self.lo + index as u16);
            }
        }
        Err(SessionError::IdsExhausted(state.in_use))
    }

    /// Return `id` to the pool. Returns `false` if it was not allocated.
    pub fn release(&self, id: u16) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_set(index) {
            return false;
        }
        state.clear(index);
        state.in_use -= 1;
        true
    }

    /// Whether `id` is currently allocated.
    pub fn is_allocated(&self, id: u16) -> bool {
        self.index_of(id).is_some_and(|index| {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_set(index)
        })
    }

    pub fn in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index_of(&self, id: u16) -> Option<usize> {
        let index = usize::from(id.checked_sub(self.lo)?);
        (index < self.capacity).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn default_range_skips_zero() {
        let ids = StreamIdAllocator::new();
        assert_eq!(ids.capacity(), 65535);
        assert_eq!(ids.alloc().expect("first id"), 1);
        assert_eq!(ids.alloc().expect("second id"), 2);
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn outstanding_ids_are_never_reissued() {
        let ids = StreamIdAllocator::with_range(1, 8);
        let first: HashSet<u16> = (0..8).map(|_| ids.alloc().expect("id available")).collect();
        assert_eq!(first.len(), 8);

        assert!(matches!(ids.alloc(), Err(SessionError::IdsExhausted(8))));

        assert!(ids.release(5));
        assert_eq!(ids.alloc().expect("released id reusable"), 5);
    }

    #[test]
    fn release_of_unallocated_id_is_noop() {
        let ids = StreamIdAllocator::with_range(10, 12);
        assert!(!ids.release(11));
        assert!(!ids.release(0));
        assert!(!ids.release(500));

        let id = ids.alloc().expect("id available");
        assert!(ids.release(id));
        assert!(!ids.release(id));
        assert_eq!(ids.in_use(), 0);
    }

    #[test]
    fn released_ids_are_reused_last() {
        let ids = StreamIdAllocator::with_range(1, 4);
        let a = ids.alloc().expect("id");
        assert!(ids.release(a));
        let b = ids.alloc().expect("id");
        assert_ne!(a, b);
        assert!(ids.is_allocated(b));
        assert!(!ids.is_allocated(a));
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let ids = Arc::new(StreamIdAllocator::with_range(1, 4000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || {
                    (0..1000)
                        .map(|_| ids.alloc().expect("capacity suffices"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("allocator thread") {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(ids.in_use(), 4000);
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn zero_lower_bound_panics() {
        let _ = StreamIdAllocator::with_range(0, 10);
    }
}
