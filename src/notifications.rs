//! Notification handshake between the debug-API callback thread (producer)
//! and the host debugger's wait loop (consumer).
//!
//! Three booleans carry the state. For the producer:
//!
//! ```text
//! ready   == !sent && !pending_send
//! pending == !sent &&  pending_send
//! sent    ==  sent && !pending_send
//! ```
//!
//! `sent && pending_send` is unreachable. For the consumer:
//!
//! ```text
//! none       == !sent && !received
//! received   ==  sent &&  received
//! pending_rx ==  sent && !received
//! ```
//!
//! While `blocked`, a notification is stored as pending and delivered by
//! `accept`. A notification arriving while a previous one is still being
//! serviced is recorded as an aliased event: the consumer drains a second
//! time before resuming, and no second stop signal is emitted. A sent but
//! never-received notification is resent when the consumer's wait loop
//! times out.

use crate::host::{SignalHost, StopSignal, WaitStatus};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyData {
    /// Host thread preferred as the signal target.
    pub tid: Option<u32>,
    /// The consumer timed out waiting; resend if a signal was lost.
    pub timeout: bool,
}

#[derive(Debug, Default)]
struct State {
    blocked: bool,
    pending_send: bool,
    aliased_event: bool,
    sent: bool,
    received: bool,
    tid: u32,
    pending_data: NotifyData,
}

/// The only cross-thread shared record of the debugger core; one mutex
/// guards every transition. Signal delivery happens inside the critical
/// section, which is safe because the consumer thread never holds the lock
/// while waiting for signals.
#[derive(Debug, Default)]
pub struct Notifications {
    state: Mutex<State>,
    trace: bool,
}

impl Notifications {
    #[must_use]
    pub fn new(trace: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            trace,
        }
    }

    fn trace(&self, msg: &str) {
        if self.trace {
            log::debug!("notifications -- {msg}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("notification lock poisoned")
    }

    pub fn reset(&self) {
        let mut s = self.lock();
        s.blocked = false;
        s.pending_send = false;
        s.sent = false;
        s.received = false;
        s.tid = 0;
    }

    /// Stop signals are parked as pending until `accept`.
    pub fn block(&self) {
        self.lock().blocked = true;
    }

    /// Unblocks, delivering the parked notification if one is waiting.
    pub fn accept<H: SignalHost>(&self, host: &H) {
        let mut s = self.lock();
        s.blocked = false;
        if s.pending_send {
            self.trace("accept: sending pending notification");
            let data = s.pending_data;
            self.send(&mut s, &data, host);
            s.pending_send = false;
            s.pending_data = NotifyData::default();
        }
    }

    /// Producer entry point, called from the debug-API callback thread.
    pub fn notify<H: SignalHost>(&self, data: NotifyData, host: &H) {
        let mut s = self.lock();
        if data.timeout {
            // was there a timeout waiting for a response?
            if s.sent && !s.received {
                self.trace("timeout: resending notification");
                let target = NotifyData {
                    tid: Some(s.tid),
                    timeout: true,
                };
                self.send(&mut s, &target, host);
            }
        } else if s.sent {
            self.trace("aliased event: will examine before resuming");
            s.aliased_event = true;
        } else if s.pending_send {
            self.trace("ignoring: another notification is already pending");
        } else if s.blocked {
            self.trace("blocked: marking notification as pending_send");
            s.pending_send = true;
            s.pending_data = data;
        } else {
            self.send(&mut s, &data, host);
        }
    }

    /// Delivers the stop signal: to the requested thread if it accepts it,
    /// otherwise to the first live host thread that does.
    fn send<H: SignalHost>(&self, s: &mut State, data: &NotifyData, host: &H) {
        if let Some(tid) = data.tid {
            let ok = host.deliver_stop_signal(tid);
            self.trace(&format!(
                "sent specifically to the given host thread: tid {tid} -> {}",
                if ok { "success" } else { "FAILED" }
            ));
            if ok {
                s.tid = tid;
                s.sent = true;
                return;
            }
        }
        for tid in host.thread_ids() {
            if host.deliver_stop_signal(tid) {
                self.trace(&format!("sent to the first valid thread: tid {tid}"));
                s.tid = tid;
                s.sent = true;
                return;
            }
        }
        self.trace("sent to the first valid thread: FAILED");
    }

    /// A second event arrived before the first was drained?
    #[must_use]
    pub fn aliased_event(&self) -> bool {
        self.lock().aliased_event
    }

    pub fn reset_aliased_event(&self) {
        self.lock().aliased_event = false;
    }

    /// Sent but not yet received.
    #[must_use]
    pub fn pending(&self) -> bool {
        let s = self.lock();
        s.sent && !s.received
    }

    #[must_use]
    pub fn received(&self) -> bool {
        self.lock().received
    }

    /// A notification is deemed received when its stop signal is the
    /// reason the given thread stopped.
    pub fn analyze(&self, stopped_tid: u32, ws: &WaitStatus, trap_expected: bool) {
        let mut s = self.lock();
        if s.sent
            && s.tid == stopped_tid
            && *ws == WaitStatus::Stopped(StopSignal::Trap)
            && !trap_expected
        {
            self.trace(&format!("received notification to thread {stopped_tid}"));
            s.received = true;
        }
    }

    pub fn mark_consumed(&self) {
        let mut s = self.lock();
        if s.received {
            self.trace(&format!("consuming notification to thread {}", s.tid));
            s.sent = false;
            s.received = false;
            s.tid = 0;
        }
    }

    /// Drops a parked notification without sending it.
    pub fn consume_pending(&self) {
        self.lock().pending_send = false;
    }

    /// The producer-side illegal state; checked by tests after every
    /// transition.
    #[must_use]
    pub fn sent_and_pending(&self) -> bool {
        let s = self.lock();
        s.sent && s.pending_send
    }
}
