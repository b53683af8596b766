//! Single-threaded event loop: FIFO task queue plus a deadline-ordered
//! timer heap
//!
//! All protocol work runs from [`EventLoop::pop_task`]. Timers never run
//! code themselves; when time is advanced past their deadline they post a
//! [`Task::Timer`] onto the same FIFO, so a timer expiry and a received
//! frame are processed in the order they were posted.
//!
//! ```text
//!   advance(now) ──► expired timers ──┐
//!                                     ▼
//!   post(task) ─────────────────► [ FIFO ] ──► pop_task() ──► handler
//! ```
//!
//! Time is injected: the loop only knows the milliseconds handed to
//! [`EventLoop::advance`].

use crate::hal::{RxFrame, TxStatus};
use crate::message::Message;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

/// Software timers of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Periodic advertisement of one network
    Advertisement { network: usize },
    /// Attach request retry
    AttachRequest,
    /// SID request retry
    SidRequest,
    /// Link quality estimation of one HAL
    LinkQuality { hal: usize },
    /// Neighbor aging of one HAL
    NeighborUpdate { hal: usize },
    /// Discovery scan step
    Discovery,
    /// Start of the next periodic discovery scan
    DiscoveryStart,
    /// Forget the migration candidate counted so far
    MigrateReset,
    /// Auth retry or relay timeout
    Auth,
    /// Address query state update
    AddressQuery,
    /// SID cache aging
    AddrCacheCheck,
    /// Periodic address notification to the leader
    Notification,
    /// HAL transmission completion timeout
    Sending { hal: usize },
    /// Distance-vector table broadcast
    RoutingUpdate,
    /// Boundary of our own wake-up schedule
    LowPowerSlot,
    /// Boundary of the parent's schedule followed by a sleepy child
    ParentSlot,
}

/// Work item executed on the node context
#[derive(Debug)]
pub enum Task {
    /// Frame handed over by a HAL receiver
    Receive(RxFrame),
    /// Try to transmit the next queued message on a HAL
    SendNext { hal: usize },
    /// Asynchronous transmission completion
    SendDone { hal: usize, status: TxStatus },
    /// Locally addressed message, dispatched without touching a radio
    Loopback(Message),
    /// Message from the external authentication server
    AuthServer(Vec<u8>),
    /// Timer expiry
    Timer(TimerKind),
}

/// Task queue and timer heap
#[derive(Debug, Default)]
pub struct EventLoop {
    now: u64,
    running: bool,
    tasks: VecDeque<Task>,
    timers: BinaryHeap<Reverse<(u64, u64, TimerKind)>>,
    /// Generation of the armed instance of each timer
    armed: HashMap<TimerKind, u64>,
    generation: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current injected time in milliseconds
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop the loop, dropping every pending task and timer
    pub fn stop(&mut self) {
        self.running = false;
        self.tasks.clear();
        self.timers.clear();
        self.armed.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Post a task at the back of the FIFO
    pub fn post(&mut self, task: Task) {
        if self.running {
            self.tasks.push_back(task);
        }
    }

    /// Next task to run
    pub fn pop_task(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Arm (or re-arm) a timer `delay_ms` from now
    pub fn start_timer(&mut self, kind: TimerKind, delay_ms: u64) {
        if !self.running {
            return;
        }
        self.generation += 1;
        self.armed.insert(kind, self.generation);
        self.timers
            .push(Reverse((self.now + delay_ms, self.generation, kind)));
    }

    /// Disarm a timer; stale heap entries are skipped when they surface
    pub fn stop_timer(&mut self, kind: TimerKind) {
        self.armed.remove(&kind);
    }

    pub fn is_timer_active(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|Reverse((_, gen, kind))| self.armed.get(kind) == Some(gen))
            .map(|Reverse((deadline, _, _))| *deadline)
            .min()
    }

    /// Move time forward and post every timer that expired
    ///
    /// Returns the number of timers fired. Time never goes backwards.
    pub fn advance(&mut self, now_ms: u64) -> usize {
        self.now = self.now.max(now_ms);
        let mut fired = 0;
        while let Some(Reverse((deadline, gen, kind))) = self.timers.peek().copied() {
            if deadline > self.now {
                break;
            }
            self.timers.pop();
            if self.armed.get(&kind) != Some(&gen) {
                continue;
            }
            self.armed.remove(&kind);
            self.tasks.push_back(Task::Timer(kind));
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_timer(el: &mut EventLoop) -> Option<TimerKind> {
        match el.pop_task()? {
            Task::Timer(kind) => Some(kind),
            _ => None,
        }
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut el = EventLoop::new();
        el.start();
        el.start_timer(TimerKind::Discovery, 300);
        el.start_timer(TimerKind::AttachRequest, 100);
        el.start_timer(TimerKind::Notification, 200);
        assert_eq!(el.next_deadline(), Some(100));
        assert_eq!(el.advance(250), 2);
        assert_eq!(next_timer(&mut el), Some(TimerKind::AttachRequest));
        assert_eq!(next_timer(&mut el), Some(TimerKind::Notification));
        assert!(el.pop_task().is_none());
        el.advance(300);
        assert_eq!(next_timer(&mut el), Some(TimerKind::Discovery));
    }

    #[test]
    fn test_stop_and_rearm() {
        let mut el = EventLoop::new();
        el.start();
        el.start_timer(TimerKind::Auth, 100);
        el.stop_timer(TimerKind::Auth);
        assert!(!el.is_timer_active(TimerKind::Auth));
        assert_eq!(el.advance(200), 0);

        el.start_timer(TimerKind::Auth, 100);
        el.start_timer(TimerKind::Auth, 500);
        assert_eq!(el.advance(400), 0);
        assert_eq!(el.advance(700), 1);
    }

    #[test]
    fn test_fifo_between_tasks_and_timers() {
        let mut el = EventLoop::new();
        el.start();
        el.post(Task::SendNext { hal: 0 });
        el.start_timer(TimerKind::SidRequest, 0);
        el.advance(0);
        assert!(matches!(el.pop_task(), Some(Task::SendNext { hal: 0 })));
        assert_eq!(next_timer(&mut el), Some(TimerKind::SidRequest));
    }

    #[test]
    fn test_stopped_loop_ignores_work() {
        let mut el = EventLoop::new();
        el.post(Task::SendNext { hal: 0 });
        el.start_timer(TimerKind::Discovery, 0);
        assert_eq!(el.pending_tasks(), 0);
        assert!(!el.is_timer_active(TimerKind::Discovery));
        el.start();
        el.start_timer(TimerKind::Discovery, 10);
        el.stop();
        assert!(!el.is_running());
        assert_eq!(el.advance(100), 0);
    }
}
