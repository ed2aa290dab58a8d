use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::debug;

use cairn_types::error::{CairnError, Result};

/// Heap slot sentinel for entries that were popped or cancelled.
const GONE: usize = usize::MAX;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct Entry<T> {
    at: i64, // UNIX time in milliseconds
    payload: T,
    pos: usize,
}

/// Binary min-heap keyed by firing time, with index-stable entries so a
/// handle can cancel or reschedule in O(log n).
struct Queue<T> {
    entries: HashMap<u64, Entry<T>>,
    heap: Vec<u64>,
    next_id: u64,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            heap: Vec::new(),
            next_id: 0,
        }
    }

    fn at(&self, id: u64) -> i64 {
        self.entries[&id].at
    }

    fn set_pos(&mut self, id: u64, pos: usize) {
        self.entries.get_mut(&id).expect("entry exists").pos = pos;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.at(self.heap[pos]) >= self.at(self.heap[parent]) {
                break;
            }
            self.heap.swap(pos, parent);
            self.set_pos(self.heap[pos], pos);
            self.set_pos(self.heap[parent], parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < self.heap.len() && self.at(self.heap[right]) < self.at(self.heap[left]) {
                smallest = right;
            }
            if self.at(self.heap[pos]) <= self.at(self.heap[smallest]) {
                break;
            }
            self.heap.swap(pos, smallest);
            self.set_pos(self.heap[pos], pos);
            self.set_pos(self.heap[smallest], smallest);
            pos = smallest;
        }
    }

    fn insert(&mut self, at: i64, payload: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let pos = self.heap.len();
        self.entries.insert(id, Entry { at, payload, pos });
        self.heap.push(id);
        self.sift_up(pos);
        id
    }

    /// Remove an arbitrary entry by id. Returns false if already gone.
    fn remove(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };
        let pos = entry.pos;
        if pos == GONE {
            return false;
        }
        self.detach(pos);
        self.entries.remove(&id);
        true
    }

    /// Move a live entry to a new firing time. Returns false if gone.
    fn reschedule(&mut self, id: u64, at: i64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let pos = entry.pos;
        if pos == GONE {
            return false;
        }
        entry.at = at;
        self.sift_up(pos);
        self.sift_down(self.entries[&id].pos);
        true
    }

    /// Unlink the heap slot at `pos`, keeping heap order for the rest.
    fn detach(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        let removed = self.heap.pop().expect("heap not empty");
        self.set_pos(removed, GONE);
        if pos < self.heap.len() {
            let filler = self.heap[pos];
            self.set_pos(filler, pos);
            self.sift_down(pos);
            // Only one of the two repairs can apply to the filler.
            if self.entries[&filler].pos == pos {
                self.sift_up(pos);
            }
        }
    }

    /// Pop the root if it is due at `now`.
    fn pop_due(&mut self, now: i64) -> Option<T> {
        let &id = self.heap.first()?;
        if self.at(id) > now {
            return None;
        }
        self.detach(0);
        let entry = self.entries.remove(&id).expect("entry exists");
        Some(entry.payload)
    }

    fn next_at(&self) -> Option<i64> {
        self.heap.first().map(|&id| self.at(id))
    }
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    ready: Sender<T>,
    wakeup_tx: Sender<()>,
    wakeup_rx: Receiver<()>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<T> Shared<T> {
    /// Edge-triggered: the dispatcher coalesces redundant wakeups.
    fn wake(&self) {
        let _ = self.wakeup_tx.try_send(());
    }
}

/// Generic timer queue: events are emitted on the ready channel when their
/// firing time arrives. Among events with equal firing times the emission
/// order is unspecified; across distinct times, earlier fires first.
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Handle to a scheduled event, valid until it fires or is cancelled.
pub struct EventHandle<T> {
    id: u64,
    shared: Weak<Shared<T>>,
}

impl<T: Send + 'static> Scheduler<T> {
    /// Events that come due are delivered on `ready`.
    pub fn new(ready: Sender<T>) -> Self {
        let (wakeup_tx, wakeup_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::new()),
                ready,
                wakeup_tx,
                wakeup_rx,
                stop_tx,
                stop_rx,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Start the dispatcher. Returns a channel that disconnects once the
    /// dispatcher has drained and exited.
    pub fn start(&self) -> Result<Receiver<()>> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(CairnError::Other("scheduler already started".into()));
        }

        let shared = Arc::clone(&self.shared);
        let (stopped_tx, stopped_rx) = bounded::<()>(0);
        std::thread::spawn(move || {
            let _stopped_tx = stopped_tx; // dropped on exit, disconnecting the channel
            loop {
                // Pop everything that is due and note the next deadline,
                // then emit outside the lock so a blocked ready channel
                // never stalls schedule/cancel callers.
                let (due, delay) = {
                    let mut queue = shared.queue.lock().expect("scheduler queue poisoned");
                    let mut due = Vec::new();
                    let delay = loop {
                        let now = now_ms();
                        match queue.pop_due(now) {
                            Some(payload) => due.push(payload),
                            None => break queue.next_at().map(|at| at - now),
                        }
                    };
                    (due, delay)
                };
                for payload in due {
                    if shared.ready.send(payload).is_err() {
                        return; // receiver gone
                    }
                }

                match delay {
                    None => {
                        select! {
                            recv(shared.wakeup_rx) -> _ => {}
                            recv(shared.stop_rx) -> _ => return,
                        }
                    }
                    Some(delay) => {
                        let delay = Duration::from_millis(delay.max(0) as u64);
                        select! {
                            recv(shared.wakeup_rx) -> _ => {}
                            recv(shared.stop_rx) -> _ => return,
                            default(delay) => {}
                        }
                    }
                }
            }
        });

        Ok(stopped_rx)
    }

    /// Stop the dispatcher. Queued events are dropped; running consumers
    /// are unaffected. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.shared.stop_tx.try_send(());
        }
    }

    pub fn schedule_at(&self, payload: T, at: DateTime<Local>) -> EventHandle<T> {
        let id = {
            let mut queue = self.shared.queue.lock().expect("scheduler queue poisoned");
            queue.insert(at.timestamp_millis(), payload)
        };
        self.shared.wake();
        debug!(id, at = %at, "scheduled event");
        EventHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn schedule_after(&self, payload: T, delay: Duration) -> EventHandle<T> {
        let at = Local::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.schedule_at(payload, at)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().expect("scheduler queue poisoned").heap.len()
    }
}

impl<T> EventHandle<T> {
    /// Cancel the event. Returns false when it already fired or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let removed = {
            let mut queue = shared.queue.lock().expect("scheduler queue poisoned");
            queue.remove(self.id)
        };
        if removed {
            shared.wake();
        }
        removed
    }

    /// Move the event to a new firing time. Returns false when it already
    /// fired or was cancelled.
    pub fn reschedule(&self, at: DateTime<Local>) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let moved = {
            let mut queue = shared.queue.lock().expect("scheduler queue poisoned");
            queue.reschedule(self.id, at.timestamp_millis())
        };
        if moved {
            shared.wake();
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_scheduler() -> (Scheduler<u32>, Receiver<u32>, Receiver<()>) {
        let (ready_tx, ready_rx) = bounded(64);
        let scheduler = Scheduler::new(ready_tx);
        let stopped = scheduler.start().unwrap();
        (scheduler, ready_rx, stopped)
    }

    #[test]
    fn earlier_events_fire_first() {
        let (scheduler, ready, _stopped) = run_scheduler();
        let base = Local::now();
        scheduler.schedule_at(3, base + chrono::Duration::milliseconds(120));
        scheduler.schedule_at(1, base + chrono::Duration::milliseconds(20));
        scheduler.schedule_at(2, base + chrono::Duration::milliseconds(70));

        let order: Vec<u32> = (0..3)
            .map(|_| ready.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        scheduler.stop();
    }

    #[test]
    fn past_events_fire_immediately() {
        let (scheduler, ready, _stopped) = run_scheduler();
        scheduler.schedule_at(7, Local::now() - chrono::Duration::seconds(5));
        assert_eq!(ready.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
        scheduler.stop();
    }

    #[test]
    fn cancel_prevents_delivery() {
        let (scheduler, ready, _stopped) = run_scheduler();
        let handle = scheduler.schedule_after(1, Duration::from_millis(80));
        scheduler.schedule_after(2, Duration::from_millis(120));
        assert!(handle.cancel());
        assert!(!handle.cancel());

        assert_eq!(ready.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert!(ready.recv_timeout(Duration::from_millis(100)).is_err());
        scheduler.stop();
    }

    #[test]
    fn reschedule_moves_firing_time() {
        let (scheduler, ready, _stopped) = run_scheduler();
        let handle = scheduler.schedule_after(1, Duration::from_secs(30));
        scheduler.schedule_after(2, Duration::from_millis(50));
        assert!(handle.reschedule(Local::now() + chrono::Duration::milliseconds(300)));

        let first = ready.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = ready.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((first, second), (2, 1));
        scheduler.stop();
    }

    #[test]
    fn handle_is_dead_after_firing() {
        let (scheduler, ready, _stopped) = run_scheduler();
        let handle = scheduler.schedule_after(1, Duration::from_millis(10));
        assert_eq!(ready.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(!handle.cancel());
        assert!(!handle.reschedule(Local::now() + chrono::Duration::seconds(1)));
        scheduler.stop();
    }

    #[test]
    fn stop_disconnects_stopped_channel() {
        let (scheduler, _ready, stopped) = run_scheduler();
        scheduler.schedule_after(1, Duration::from_secs(300));
        scheduler.stop();
        assert!(matches!(
            stopped.recv_timeout(Duration::from_secs(2)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn double_start_rejected() {
        let (ready_tx, _ready_rx) = bounded(1);
        let scheduler: Scheduler<u32> = Scheduler::new(ready_tx);
        let _stopped = scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        scheduler.stop();
    }

    #[test]
    fn heap_handles_interleaved_cancel_and_insert() {
        let (ready_tx, ready_rx) = bounded(64);
        let scheduler = Scheduler::new(ready_tx);
        // Not started: exercise the queue directly through the public API.
        let far = Local::now() + chrono::Duration::seconds(600);
        let handles: Vec<_> = (0u32..20)
            .map(|i| scheduler.schedule_at(i, far + chrono::Duration::seconds(i as i64)))
            .collect();
        for handle in handles.iter().step_by(2) {
            assert!(handle.cancel());
        }
        assert_eq!(scheduler.pending(), 10);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.reschedule(far), i % 2 == 1);
        }
        drop(ready_rx);
    }
}
