//! Cooperative event loops behind the service threads.
//!
//! Each named event owns a slot: a mutex/condvar pair, a tick timeout, an
//! activation state and a queued counter. A service thread drives
//! `activate` with its callback; any other thread wakes it through the
//! central trigger (`queue_wake`), whose own loop fans queued wakeups out
//! to the named slots at most once per tick.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Queue,
    Merge,
    Ctrl,
    Status,
    Trigger,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Queue => "queue",
            EventKind::Merge => "merge",
            EventKind::Ctrl => "ctrl",
            EventKind::Status => "status",
            EventKind::Trigger => "trigger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventStatus {
    Null,
    ThreadStarted,
    Init,
    Active,
}

struct SlotState {
    status: EventStatus,
    pulsed: bool,
}

pub struct EventSlot {
    kind: EventKind,
    timeout: Duration,
    state: Mutex<SlotState>,
    cond: Condvar,
    queued: AtomicI64,
    num_calls: AtomicU64,
}

impl EventSlot {
    pub fn new(kind: EventKind, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            state: Mutex::new(SlotState { status: EventStatus::Null, pulsed: false }),
            cond: Condvar::new(),
            queued: AtomicI64::new(0),
            num_calls: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn status(&self) -> EventStatus {
        self.state.lock().status
    }

    /// First thing a service thread does in its slot.
    pub fn thread_entered(&self) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.status, EventStatus::Null);
        st.status = EventStatus::ThreadStarted;
    }

    pub fn init(&self) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.status, EventStatus::ThreadStarted);
        trace!("init {} event", self.kind.name());
        st.status = EventStatus::Init;
    }

    /// Runs `callback` once per tick until deactivated. A tick happens on
    /// every pulse and at least every `timeout`.
    pub fn activate(&self, mut callback: impl FnMut()) {
        {
            let mut st = self.state.lock();
            debug_assert_eq!(st.status, EventStatus::Init);
            debug!("activating {} event", self.kind.name());
            st.status = EventStatus::Active;
        }

        loop {
            self.num_calls.fetch_add(1, Ordering::Relaxed);
            callback();

            let mut st = self.state.lock();
            if st.status != EventStatus::Active {
                break;
            }
            if !st.pulsed {
                self.cond.wait_for(&mut st, self.timeout);
            }
            st.pulsed = false;
            if st.status != EventStatus::Active {
                break;
            }
        }

        let mut st = self.state.lock();
        st.status = EventStatus::Init;
        st.pulsed = false;
    }

    /// Requests loop exit. Idempotent; a callback already running finishes
    /// its tick. Serialized with `pulse` through the slot mutex.
    pub fn deactivate(&self) {
        let mut st = self.state.lock();
        if st.status == EventStatus::Active {
            debug!("deactivating {} event", self.kind.name());
            st.status = EventStatus::Init;
            self.cond.notify_all();
        }
    }

    pub fn deinit(&self) {
        let mut st = self.state.lock();
        debug_assert_eq!(st.status, EventStatus::Init);
        trace!("deinit {} event", self.kind.name());
        st.status = EventStatus::ThreadStarted;
        st.pulsed = false;
    }

    /// Wakes the loop for an immediate tick. A no-op unless active; the
    /// mutex makes the caller's preceding writes visible to the callback.
    pub fn pulse(&self) {
        let mut st = self.state.lock();
        if st.status == EventStatus::Active {
            trace!("pulsing {} event", self.kind.name());
            st.pulsed = true;
            self.cond.notify_all();
        }
    }

    pub fn add_queued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Consumes one queued wakeup if present, pulsing the slot.
    fn drain_one(&self) {
        if self.queued.load(Ordering::SeqCst) > 0 {
            self.pulse();
            let prev = self.queued.fetch_sub(1, Ordering::SeqCst);
            if prev <= 0 {
                warn!("{} queued counter went negative", self.kind.name());
                self.queued.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }
}

/// The default tick; merge is less eager, trigger is driven externally.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const MERGE_TIMEOUT: Duration = Duration::from_secs(2);
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Events {
    pub trigger: EventSlot,
    pub queue: EventSlot,
    pub merge: EventSlot,
    pub ctrl: EventSlot,
    pub status: EventSlot,
}

impl Events {
    pub fn new() -> Self {
        Self {
            trigger: EventSlot::new(EventKind::Trigger, TRIGGER_TIMEOUT),
            queue: EventSlot::new(EventKind::Queue, DEFAULT_TIMEOUT),
            merge: EventSlot::new(EventKind::Merge, MERGE_TIMEOUT),
            ctrl: EventSlot::new(EventKind::Ctrl, DEFAULT_TIMEOUT),
            status: EventSlot::new(EventKind::Status, DEFAULT_TIMEOUT),
        }
    }

    /// Queues a wakeup for `slot` and nudges the trigger loop to deliver
    /// it. Safe to call before the loops are running; the counter is
    /// drained once the trigger activates.
    pub fn queue_wake(&self, slot: &EventSlot) {
        slot.add_queued();
        self.trigger.pulse();
    }

    /// One trigger tick: deliver at most one queued wakeup per slot.
    pub fn drain_queues(&self) {
        self.queue.drain_one();
        self.ctrl.drain_one();
        self.merge.drain_one();
        self.status.drain_one();
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

/// Service loop for the central trigger: fan queued wakeups out to the
/// named events until the orchestrator raises `events_queue_done`. A final
/// drain after the loop delivers anything queued during shutdown.
pub fn trigger_loop(session: std::sync::Arc<crate::session::Session>) {
    use std::sync::atomic::Ordering;

    let ev = &session.events.trigger;
    ev.thread_entered();
    ev.init();

    if !session.events_queue_done.load(Ordering::SeqCst) {
        debug!("start trigger event loop");
        ev.activate(|| {
            if session.events_queue_done.load(Ordering::SeqCst) {
                session.events.trigger.deactivate();
            }
            session.events.drain_queues();
        });
    }

    session.events.drain_queues();
    debug!("trigger loop exiting after {} ticks", ev.num_calls());
    ev.deinit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_slot_lifecycle() {
        let slot = EventSlot::new(EventKind::Queue, Duration::from_millis(10));
        assert_eq!(slot.status(), EventStatus::Null);
        slot.thread_entered();
        assert_eq!(slot.status(), EventStatus::ThreadStarted);
        slot.init();
        assert_eq!(slot.status(), EventStatus::Init);
        slot.deinit();
        assert_eq!(slot.status(), EventStatus::ThreadStarted);
    }

    #[test]
    fn test_deactivate_stops_loop() {
        let slot = Arc::new(EventSlot::new(EventKind::Merge, Duration::from_millis(5)));
        slot.thread_entered();
        slot.init();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks2 = ticks.clone();
        let slot2 = slot.clone();
        let th = std::thread::spawn(move || {
            slot2.activate(|| {
                ticks2.fetch_add(1, Ordering::SeqCst);
            });
        });

        while ticks.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(Duration::from_millis(1));
        }
        slot.deactivate();
        th.join().unwrap();
        assert_eq!(slot.status(), EventStatus::Init);
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_deactivate_from_inside_callback() {
        let slot = Arc::new(EventSlot::new(EventKind::Ctrl, Duration::from_millis(5)));
        slot.thread_entered();
        slot.init();

        let slot2 = slot.clone();
        let mut calls = 0;
        slot.activate(|| {
            calls += 1;
            slot2.deactivate();
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_queue_wake_accumulates_before_activation() {
        let events = Events::new();
        events.queue_wake(&events.merge);
        events.queue_wake(&events.merge);
        assert_eq!(events.merge.queued.load(Ordering::SeqCst), 2);

        // Draining with inactive slots still consumes the counters.
        events.drain_queues();
        events.drain_queues();
        assert_eq!(events.merge.queued.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pulse_wakes_waiting_loop_early() {
        let slot = Arc::new(EventSlot::new(EventKind::Status, Duration::from_secs(60)));
        slot.thread_entered();
        slot.init();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks2 = ticks.clone();
        let slot2 = slot.clone();
        let th = std::thread::spawn(move || {
            slot2.activate(|| {
                ticks2.fetch_add(1, Ordering::SeqCst);
            });
        });

        while ticks.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        slot.pulse();
        while ticks.load(Ordering::SeqCst) < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        slot.deactivate();
        th.join().unwrap();
    }
}
