//! Low-power wake-up scheduling
//!
//! Time is cut into slots of [`SCHEDULE_SLOT_INTERVAL_MS`]. Every node
//! with a schedule is awake for one slot out of a cycle; the slot after
//! `slot` is derived from the node's mac so a child that knows its
//! parent's current slot can compute every later one:
//!
//! ```text
//! next = hash(mac, slot) % SCHEDULE_SLOTS_SIZE + 1
//! wake = (next + SCHEDULE_SLOTS_SIZE - slot) * SCHEDULE_SLOT_INTERVAL_MS
//! ```
//!
//! Routers run their own schedule so the sleepy children heard during a
//! window lose their WAKEUP flag when it ends; frames for them are held
//! in the neighbor's buffer queue until the next link request. A node
//! without `RX_ON` sleeps outside its parent's windows and, on waking,
//! asks its parent for buffered frames with a link request.

use crate::node::MeshNode;
use crate::timer::TimerKind;
use crate::tlv::{TimeSlot, Tlvs};
use crate::types::{DeviceState, ExtAddr, InterfaceDownReason, EXT_ADDR_SIZE};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, trace};

/// Slots in one schedule cycle
pub const SCHEDULE_SLOTS_SIZE: u8 = 3;
/// Length of one slot
pub const SCHEDULE_SLOT_INTERVAL_MS: u64 = 1_000;

/// Which timeline the own schedule follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScheduleType {
    None,
    /// Detached sleepy node waiting for its first window
    Attaching,
    /// Attached node with its own windows
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotPhase {
    Sleeping,
    Awake,
}

/// Low-power bookkeeping of a node
#[derive(Debug, Clone)]
pub struct LowPowerState {
    /// Radio listening
    pub up: bool,
    pub schedule: ScheduleType,
    /// Current slot of the own schedule
    pub slot_num: u8,
    pub next_slot_num: u8,
    /// Start of the current own cycle
    slot_started: u64,
    pub own_phase: SlotPhase,
    /// Parent slot as last reported, offset relative to `parent_slot_at`
    parent_slot: Option<TimeSlot>,
    parent_slot_at: u64,
    pub parent_phase: SlotPhase,
    /// Frames the parent holds for us
    pub parent_bufqueue: Option<u8>,
    sleep_started: u64,
    /// Total time spent with the radio down
    pub sleep_time: u64,
}

impl LowPowerState {
    pub fn new(rx_on: bool) -> Self {
        Self {
            up: rx_on,
            schedule: ScheduleType::None,
            slot_num: 1,
            next_slot_num: 1,
            slot_started: 0,
            own_phase: SlotPhase::Sleeping,
            parent_slot: None,
            parent_slot_at: 0,
            parent_phase: SlotPhase::Sleeping,
            parent_bufqueue: None,
            sleep_started: 0,
            sleep_time: 0,
        }
    }
}

/// Bob Jenkins' `lookup3` hashword
fn hashword(words: &[u32], initval: u32) -> u32 {
    fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
        *a = a.wrapping_sub(*c);
        *a ^= c.rotate_left(4);
        *c = c.wrapping_add(*b);
        *b = b.wrapping_sub(*a);
        *b ^= a.rotate_left(6);
        *a = a.wrapping_add(*c);
        *c = c.wrapping_sub(*b);
        *c ^= b.rotate_left(8);
        *b = b.wrapping_add(*a);
        *a = a.wrapping_sub(*c);
        *a ^= c.rotate_left(16);
        *c = c.wrapping_add(*b);
        *b = b.wrapping_sub(*a);
        *b ^= a.rotate_left(19);
        *a = a.wrapping_add(*c);
        *c = c.wrapping_sub(*b);
        *c ^= b.rotate_left(4);
        *b = b.wrapping_add(*a);
    }

    fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
        *c ^= *b;
        *c = c.wrapping_sub(b.rotate_left(14));
        *a ^= *c;
        *a = a.wrapping_sub(c.rotate_left(11));
        *b ^= *a;
        *b = b.wrapping_sub(a.rotate_left(25));
        *c ^= *b;
        *c = c.wrapping_sub(b.rotate_left(16));
        *a ^= *c;
        *a = a.wrapping_sub(c.rotate_left(4));
        *b ^= *a;
        *b = b.wrapping_sub(a.rotate_left(14));
        *c ^= *b;
        *c = c.wrapping_sub(b.rotate_left(24));
    }

    let init = 0xdead_beef_u32
        .wrapping_add((words.len() as u32) << 2)
        .wrapping_add(initval);
    let (mut a, mut b, mut c) = (init, init, init);
    let mut k = words;
    while k.len() > 3 {
        a = a.wrapping_add(k[0]);
        b = b.wrapping_add(k[1]);
        c = c.wrapping_add(k[2]);
        mix(&mut a, &mut b, &mut c);
        k = &k[3..];
    }
    if k.is_empty() {
        return c;
    }
    if k.len() == 3 {
        c = c.wrapping_add(k[2]);
    }
    if k.len() >= 2 {
        b = b.wrapping_add(k[1]);
    }
    a = a.wrapping_add(k[0]);
    finalize(&mut a, &mut b, &mut c);
    c
}

/// Slot following `slot` in the schedule of `mac`
pub fn next_slot_num(mac: &ExtAddr, slot: u8) -> u8 {
    let bytes = mac.as_bytes();
    let mut words = [0u32; EXT_ADDR_SIZE / 4 + 1];
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words[EXT_ADDR_SIZE / 4] = slot as u32;
    (hashword(&words, 0) % SCHEDULE_SLOTS_SIZE as u32) as u8 + 1
}

/// Delay from the start of `slot` until the window of the slot after it
pub fn slot_wake_delay(mac: &ExtAddr, slot: u8) -> (u8, u64) {
    let next = next_slot_num(mac, slot);
    let cycles = (next + SCHEDULE_SLOTS_SIZE - slot) as u64;
    (next, cycles * SCHEDULE_SLOT_INTERVAL_MS)
}

impl MeshNode {
    fn is_sleepy(&self) -> bool {
        !self.mode.is_rx_on()
    }

    /// Whether received frames can be heard right now
    pub fn lowpower_is_radio_up(&self) -> bool {
        !self.is_sleepy() || self.lowpower.up
    }

    /// Time spent asleep so far
    pub fn lowpower_sleep_time(&self) -> u64 {
        let lp = &self.lowpower;
        if lp.up {
            lp.sleep_time
        } else {
            lp.sleep_time + self.now().saturating_sub(lp.sleep_started)
        }
    }

    fn radio_wakeup(&mut self) {
        if self.lowpower.up {
            return;
        }
        let now = self.now();
        self.lowpower.up = true;
        self.lowpower.sleep_time += now.saturating_sub(self.lowpower.sleep_started);
        trace!(now, "radio up");
    }

    fn radio_sleep(&mut self) {
        if !self.is_sleepy() {
            return;
        }
        let now = self.now();
        if self.lowpower.up {
            self.lowpower.sleep_started = now;
        }
        self.lowpower.up = false;
        trace!(now, "radio down");
    }

    /// Our slot and how far into the current cycle we are
    pub(crate) fn lowpower_time_slot(&self) -> TimeSlot {
        let offset = self.now().saturating_sub(self.lowpower.slot_started);
        TimeSlot {
            slot_num: self.lowpower.slot_num,
            offset: offset.min(u32::MAX as u64) as u32,
        }
    }

    /// Neighbors of a sleepy node are heard only in its windows
    pub(crate) fn lowpower_alive_threshold(&self) -> u64 {
        self.hals
            .first()
            .map(|h| h.timings.neighbor_alive_ms * 2)
            .unwrap_or(SCHEDULE_SLOT_INTERVAL_MS * 60)
    }

    fn own_mac(&self) -> ExtAddr {
        self.hals.first().map(|h| h.mac).unwrap_or(self.uuid)
    }

    /// Move the own schedule to its next window
    fn update_own_schedule(&mut self, schedule: ScheduleType) {
        let mac = self.own_mac();
        self.lowpower.slot_num = self.lowpower.next_slot_num;
        let (next, delay) = slot_wake_delay(&mac, self.lowpower.slot_num);
        self.lowpower.next_slot_num = next;
        self.lowpower.slot_started = self.now();
        self.lowpower.schedule = schedule;
        self.lowpower.own_phase = SlotPhase::Sleeping;
        self.event_loop.start_timer(TimerKind::LowPowerSlot, delay);
        trace!(slot = next, delay, "own schedule");
    }

    /// Follow the parent's schedule to its next window
    fn update_parent_schedule(&mut self) {
        self.event_loop.stop_timer(TimerKind::ParentSlot);
        let Some((_, mac)) = self.attach_node() else {
            return;
        };
        let Some(slot) = self.lowpower.parent_slot else {
            return;
        };
        let elapsed = slot.offset as u64 + self.now().saturating_sub(self.lowpower.parent_slot_at);
        let (next, delay) = slot_wake_delay(&mac, slot.slot_num);
        self.lowpower.parent_slot = Some(TimeSlot { slot_num: next, offset: 0 });
        if delay > elapsed {
            let wait = delay - elapsed;
            self.lowpower.parent_slot_at = self.now() + wait;
            self.lowpower.parent_phase = SlotPhase::Sleeping;
            self.event_loop.start_timer(TimerKind::ParentSlot, wait);
            trace!(slot = next, wait, "parent schedule");
        } else {
            // already inside the parent's window
            let late = elapsed - delay;
            self.lowpower.parent_slot_at = self.now().saturating_sub(late);
            let window = SCHEDULE_SLOT_INTERVAL_MS.saturating_sub(late).max(1);
            self.parent_window_open(window);
        }
    }

    fn parent_window_open(&mut self, window: u64) {
        self.lowpower.parent_phase = SlotPhase::Awake;
        self.radio_wakeup();
        self.event_loop.start_timer(TimerKind::ParentSlot, window);
        if let Err(err) = self.send_link_request(true) {
            debug!(reason = %err, "wake-up link request not sent");
        }
        let _ = self.send_address_notification();
    }

    fn parent_window_close(&mut self) {
        self.lowpower.parent_bufqueue = None;
        self.update_parent_schedule();
        if self.lowpower.parent_phase == SlotPhase::Sleeping && self.lowpower.own_phase == SlotPhase::Sleeping {
            self.radio_sleep();
        }
    }

    /// Own schedule boundary
    pub(crate) fn handle_lowpower_timer(&mut self) {
        match self.lowpower.own_phase {
            SlotPhase::Sleeping => {
                self.lowpower.own_phase = SlotPhase::Awake;
                self.radio_wakeup();
                if self.lowpower.schedule == ScheduleType::Attached {
                    self.event_loop
                        .start_timer(TimerKind::LowPowerSlot, SCHEDULE_SLOT_INTERVAL_MS);
                }
            }
            SlotPhase::Awake => {
                let schedule = self.lowpower.schedule;
                if schedule == ScheduleType::Attached {
                    self.lowpower_children_sleep();
                }
                self.update_own_schedule(schedule);
                if schedule != ScheduleType::Attaching && self.lowpower.parent_phase == SlotPhase::Sleeping {
                    self.radio_sleep();
                }
            }
        }
    }

    /// Parent schedule boundary
    pub(crate) fn handle_parent_slot_timer(&mut self) {
        match self.lowpower.parent_phase {
            SlotPhase::Sleeping => self.parent_window_open(SCHEDULE_SLOT_INTERVAL_MS),
            SlotPhase::Awake => self.parent_window_close(),
        }
    }

    /// End of our window: sleepy children are unreachable again
    fn lowpower_children_sleep(&mut self) {
        for hal in self.hals.iter_mut() {
            for nbr in hal.neighbors.iter_mut() {
                if !nbr.mode.is_rx_on() && nbr.state == crate::link::NeighborState::Child {
                    nbr.flags.set_wakeup(false);
                }
            }
        }
    }

    /// A sleepy neighbor showed it is listening
    pub(crate) fn lowpower_child_awake(&mut self, hal: usize, mac: &ExtAddr) {
        if let Some(nbr) = self.hals.get_mut(hal).and_then(|h| h.neighbors.get_mut(mac)) {
            if !nbr.mode.is_rx_on() {
                nbr.flags.set_wakeup(true);
            }
        }
    }

    /// Schedule hints from our parent
    pub(crate) fn lowpower_update_from_tlvs(&mut self, hal: usize, mac: &ExtAddr, tlvs: &Tlvs) {
        let from_parent = self.attach.attach_node == Some((hal, *mac)) || self.attach.candidate == Some((hal, *mac));
        if !from_parent {
            return;
        }
        if let Some(slot) = tlvs.time_slot() {
            self.lowpower.parent_slot = Some(slot);
            self.lowpower.parent_slot_at = self.now();
        }
        if let Some(queued) = tlvs.bufqueue_size() {
            self.lowpower.parent_bufqueue = Some(queued);
            if queued == 0 && self.is_sleepy() && self.lowpower.parent_phase == SlotPhase::Awake {
                debug!("parent holds nothing, sleeping early");
                self.parent_window_close();
            }
        }
    }

    pub(crate) fn lowpower_interface_up(&mut self) {
        self.stop_lowpower_timers();
        let follows_parent =
            self.is_sleepy() && self.lowpower.parent_slot.is_some() && self.state != DeviceState::Leader;
        if follows_parent {
            self.radio_sleep();
            self.update_parent_schedule();
        } else {
            // a sleepy child without its parent's slot keeps listening
            self.radio_wakeup();
            if self.state < DeviceState::Router {
                self.lowpower.schedule = ScheduleType::None;
                return;
            }
        }
        self.lowpower.next_slot_num = self.rng.gen_range(1..=SCHEDULE_SLOTS_SIZE);
        self.update_own_schedule(ScheduleType::Attached);
    }

    pub(crate) fn lowpower_interface_down(&mut self, reason: InterfaceDownReason) {
        self.stop_lowpower_timers();
        self.lowpower.schedule = ScheduleType::None;
        self.lowpower.parent_slot = None;
        self.lowpower.parent_bufqueue = None;
        self.lowpower.parent_phase = SlotPhase::Sleeping;
        self.lowpower.own_phase = SlotPhase::Sleeping;
        if !self.is_sleepy() {
            self.lowpower.up = true;
            return;
        }
        if reason == InterfaceDownReason::MeshStart {
            self.lowpower.sleep_time = 0;
            self.lowpower.sleep_started = self.now();
            self.lowpower.up = false;
            self.radio_wakeup();
        } else {
            self.radio_sleep();
        }
        if reason != InterfaceDownReason::MeshStop {
            self.lowpower.next_slot_num = self.rng.gen_range(1..=SCHEDULE_SLOTS_SIZE);
            self.update_own_schedule(ScheduleType::Attaching);
        }
    }

    fn stop_lowpower_timers(&mut self) {
        self.event_loop.stop_timer(TimerKind::LowPowerSlot);
        self.event_loop.stop_timer(TimerKind::ParentSlot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashword_known_values() {
        // lookup3 of the empty key is the bare initial value
        assert_eq!(hashword(&[], 0), 0xdead_beef);
        assert_eq!(hashword(&[1, 2, 3], 0), hashword(&[1, 2, 3], 0));
        assert_ne!(hashword(&[1, 2, 3], 0), hashword(&[1, 2, 4], 0));
        assert_ne!(hashword(&[1, 2, 3], 0), hashword(&[1, 2, 3], 1));
    }

    #[test]
    fn test_next_slot_in_range_and_shared() {
        let mac = ExtAddr([0x02, 0, 0, 0, 0, 0, 0, 7]);
        for slot in 1..=SCHEDULE_SLOTS_SIZE {
            let next = next_slot_num(&mac, slot);
            assert!((1..=SCHEDULE_SLOTS_SIZE).contains(&next));
            // parent and child derive the same sequence
            assert_eq!(next, next_slot_num(&mac, slot));
        }
    }

    #[test]
    fn test_wake_delay_spans_at_least_one_cycle() {
        let mac = ExtAddr([9; 8]);
        for slot in 1..=SCHEDULE_SLOTS_SIZE {
            let (next, delay) = slot_wake_delay(&mac, slot);
            assert_eq!(delay, (next + SCHEDULE_SLOTS_SIZE - slot) as u64 * SCHEDULE_SLOT_INTERVAL_MS);
            assert!(delay >= SCHEDULE_SLOT_INTERVAL_MS);
            assert!(delay <= 5 * SCHEDULE_SLOT_INTERVAL_MS);
        }
    }

    #[test]
    fn test_new_state_follows_rx_on() {
        assert!(LowPowerState::new(true).up);
        let sleepy = LowPowerState::new(false);
        assert!(!sleepy.up);
        assert_eq!(sleepy.schedule, ScheduleType::None);
    }
}
