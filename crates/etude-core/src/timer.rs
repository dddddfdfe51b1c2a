// src/timer.rs
//! Indexed min-heap of idle deadlines, one node per connection.
//!
//! Activity on a connection only flips a flag (`touch`); the cost of moving
//! the node is paid at sweep time, when an expired root that saw activity is
//! pushed back by a full interval instead of being fired.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: RawFd,
    expires: Instant,
    happened: bool,
    callback: TimeoutCallback,
}

#[derive(Default)]
pub struct HeapTimer {
    heap: Vec<TimerNode>,
    refs: HashMap<RawFd, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: RawFd) -> bool {
        self.refs.contains_key(&id)
    }

    /// Expiry of the node that fires next.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.first().map(|n| n.expires)
    }

    pub fn deadline(&self, id: RawFd) -> Option<Instant> {
        self.refs.get(&id).map(|&i| self.heap[i].expires)
    }

    /// Insert a node for `id`, or refresh the existing one with a new expiry and callback.
    pub fn add<F>(&mut self, id: RawFd, now: Instant, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = now + timeout;
        match self.refs.get(&id).copied() {
            Some(i) => {
                let node = &mut self.heap[i];
                node.expires = expires;
                node.happened = false;
                node.callback = Box::new(callback);
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
            None => {
                let i = self.heap.len();
                self.refs.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    happened: false,
                    callback: Box::new(callback),
                });
                self.sift_up(i);
            }
        }
    }

    /// Record activity without moving the node. O(1).
    pub fn touch(&mut self, id: RawFd) -> bool {
        match self.refs.get(&id) {
            Some(&i) => {
                self.heap[i].happened = true;
                true
            }
            None => false,
        }
    }

    /// Drop the node for `id` without running its callback.
    pub fn remove(&mut self, id: RawFd) -> bool {
        match self.refs.get(&id).copied() {
            Some(i) => {
                self.delete(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.refs.clear();
    }

    /// Fire or extend every expired root, then report how long until the next one.
    ///
    /// An expired node that saw activity gets `now + extension` and stays; one
    /// that did not is removed and its callback runs. `None` means the heap is
    /// empty and the caller may block indefinitely.
    pub fn expire_and_next_deadline(&mut self, now: Instant, extension: Duration) -> Option<Duration> {
        while let Some(root) = self.heap.first_mut() {
            if root.expires > now {
                break;
            }
            if root.happened {
                root.happened = false;
                root.expires = now + extension;
                self.sift_down(0, self.heap.len());
                continue;
            }
            let node = self.delete(0);
            (node.callback)();
        }
        self.heap
            .first()
            .map(|n| n.expires.saturating_duration_since(now))
    }

    fn delete(&mut self, index: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if index < last {
            self.swap_nodes(index, last);
        }
        let node = match self.heap.pop() {
            Some(node) => node,
            None => unreachable!("delete on an empty heap"),
        };
        self.refs.remove(&node.id);
        if index < self.heap.len() && !self.sift_down(index, self.heap.len()) {
            self.sift_up(index);
        }
        node
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node moved.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.refs.insert(self.heap[i].id, i);
        self.refs.insert(self.heap[j].id, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const IDLE: Duration = Duration::from_millis(60_000);

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (fired, move || {
            let f = f.clone();
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn idle_connection_is_closed_by_sweep() {
        let (fired, cb) = counter();
        let start = Instant::now();
        let mut timers = HeapTimer::new();
        timers.add(5, start, IDLE, cb());

        let wait = timers.expire_and_next_deadline(start + Duration::from_millis(59_999), IDLE);
        assert_eq!(wait, Some(Duration::from_millis(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let wait = timers.expire_and_next_deadline(start + IDLE, IDLE);
        assert_eq!(wait, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.contains(5));
    }

    #[test]
    fn touched_connection_survives_one_more_interval() {
        let (fired, cb) = counter();
        let start = Instant::now();
        let mut timers = HeapTimer::new();
        timers.add(7, start, IDLE, cb());

        // One byte of activity just before expiry.
        timers.touch(7);
        let sweep = start + IDLE + Duration::from_millis(3);
        let wait = timers.expire_and_next_deadline(sweep, IDLE);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(wait, Some(IDLE));
        assert_eq!(timers.deadline(7), Some(sweep + IDLE));

        // No further activity: the next sweep past the extension closes it.
        timers.expire_and_next_deadline(sweep + IDLE, IDLE);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn refresh_replaces_expiry_and_callback() {
        let (fired, cb) = counter();
        let start = Instant::now();
        let mut timers = HeapTimer::new();
        timers.add(1, start, Duration::from_millis(10), cb());
        timers.add(2, start, Duration::from_millis(20), cb());
        timers.add(1, start, Duration::from_millis(30), cb());

        assert_eq!(timers.len(), 2);
        assert_eq!(timers.next_expiry(), Some(start + Duration::from_millis(20)));

        timers.expire_and_next_deadline(start + Duration::from_millis(25), IDLE);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.contains(1));
        assert!(!timers.contains(2));
    }

    #[test]
    fn remove_skips_callback() {
        let (fired, cb) = counter();
        let start = Instant::now();
        let mut timers = HeapTimer::new();
        for id in 0..8 {
            timers.add(id, start, Duration::from_millis(10 * (id as u64 + 1)), cb());
        }
        assert!(timers.remove(3));
        assert!(!timers.remove(3));
        assert_eq!(timers.len(), 7);

        timers.expire_and_next_deadline(start + Duration::from_secs(1), IDLE);
        assert_eq!(fired.load(Ordering::SeqCst), 7);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8, u16),
        Touch(u8),
        Remove(u8),
        Sweep(u16),
    }

    impl quickcheck::Arbitrary for Op {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let id = u8::arbitrary(g) % 16;
            match u8::arbitrary(g) % 4 {
                0 => Op::Add(id, u16::arbitrary(g)),
                1 => Op::Touch(id),
                2 => Op::Remove(id),
                _ => Op::Sweep(u16::arbitrary(g)),
            }
        }
    }

    use quickcheck::Arbitrary;

    #[quickcheck]
    fn root_is_always_the_minimum_live_expiry(ops: Vec<Op>) -> bool {
        let extension = Duration::from_millis(500);
        let start = Instant::now();
        let mut now = start;
        let mut timers = HeapTimer::new();
        let mut model: HashMap<RawFd, (Instant, bool)> = HashMap::new();

        for op in ops {
            match op {
                Op::Add(id, ms) => {
                    let timeout = Duration::from_millis(ms as u64);
                    timers.add(id as RawFd, now, timeout, || {});
                    model.insert(id as RawFd, (now + timeout, false));
                }
                Op::Touch(id) => {
                    if let Some(entry) = model.get_mut(&(id as RawFd)) {
                        entry.1 = true;
                    }
                    timers.touch(id as RawFd);
                }
                Op::Remove(id) => {
                    model.remove(&(id as RawFd));
                    timers.remove(id as RawFd);
                }
                Op::Sweep(ms) => {
                    now += Duration::from_millis(ms as u64);
                    timers.expire_and_next_deadline(now, extension);
                    model.retain(|_, (expires, happened)| {
                        if *expires > now {
                            return true;
                        }
                        if *happened {
                            *expires = now + extension;
                            *happened = false;
                            return true;
                        }
                        false
                    });
                }
            }

            let expected = model.values().map(|(e, _)| *e).min();
            if timers.next_expiry() != expected || timers.len() != model.len() {
                return false;
            }
        }
        true
    }
}
