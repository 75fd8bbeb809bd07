//! Lifecycle machine - local readiness phase and lifecycle event subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::LifecycleError;

/// Coarse local phase, announced to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, read loop not started
    Uninitialized,
    /// `init` ran, phase announcement not yet made
    Ready,
    Online,
    Offline,
    /// `end` subscribers running, transport about to close
    Terminating,
    /// Transport closed, nothing further is dispatched
    Closed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminating | Self::Closed)
    }

    fn can_move_to(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Uninitialized, Ready) => true,
            (Ready | Online | Offline, Online | Offline) => true,
            (from, Terminating) => !from.is_terminal(),
            (from, Closed) => from != Closed,
            _ => false,
        }
    }
}

/// Closed set of local lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Init,
    Online,
    Offline,
    End,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::End => "end",
        }
    }
}

type Subscriber = Arc<dyn Fn() + Send + Sync>;

pub struct Lifecycle {
    phase: Mutex<Phase>,
    subscribers: Mutex<HashMap<LifecycleEvent, Vec<Subscriber>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Uninitialized),
            subscribers: Mutex::new(HashMap::new()),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `to`, returning the previous phase.
    pub fn transition(&self, to: Phase) -> Result<Phase, LifecycleError> {
        let mut phase = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let from = *phase;
        if !from.can_move_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        *phase = to;
        tracing::debug!(?from, ?to, "Lifecycle transition");
        Ok(from)
    }

    /// Enter `Terminating`. Only the first caller gets `true`; it owns running
    /// the `end` subscribers and closing the transport.
    pub fn begin_termination(&self) -> bool {
        self.transition(Phase::Terminating).is_ok()
    }

    /// Enter `Closed` from whatever phase we are in. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.transition(Phase::Closed).is_ok()
    }

    pub fn subscribe<F>(&self, event: LifecycleEvent, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Run every subscriber for `event` in registration order, on the calling task.
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe
    /// further without deadlocking.
    pub fn emit(&self, event: LifecycleEvent) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event)
            .cloned()
            .unwrap_or_default();

        tracing::debug!(
            event = event.as_str(),
            subscribers = subscribers.len(),
            "Emitting lifecycle event"
        );
        for subscriber in subscribers {
            subscriber();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn starts_uninitialized() {
        assert_eq!(Lifecycle::new().phase(), Phase::Uninitialized);
    }

    #[test]
    fn init_then_toggle() {
        let lc = Lifecycle::new();
        lc.transition(Phase::Ready).unwrap();
        lc.transition(Phase::Online).unwrap();
        lc.transition(Phase::Offline).unwrap();
        lc.transition(Phase::Online).unwrap();
        assert_eq!(lc.phase(), Phase::Online);
    }

    #[test]
    fn cannot_go_online_before_init() {
        let lc = Lifecycle::new();
        let err = lc.transition(Phase::Online).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: Phase::Uninitialized,
                to: Phase::Online
            }
        ));
    }

    #[test]
    fn init_only_once() {
        let lc = Lifecycle::new();
        lc.transition(Phase::Ready).unwrap();
        assert!(lc.transition(Phase::Ready).is_err());
    }

    #[test]
    fn termination_is_claimed_once() {
        let lc = Lifecycle::new();
        lc.transition(Phase::Ready).unwrap();

        assert!(lc.begin_termination());
        assert!(!lc.begin_termination());
        assert!(lc.transition(Phase::Online).is_err());

        assert!(lc.close());
        assert!(!lc.close());
        assert!(!lc.begin_termination());
        assert_eq!(lc.phase(), Phase::Closed);
    }

    #[test]
    fn close_allowed_from_any_live_phase() {
        let lc = Lifecycle::new();
        assert!(lc.close());
        assert_eq!(lc.phase(), Phase::Closed);
    }

    #[test]
    fn subscribers_run_in_order() {
        let lc = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            lc.subscribe(LifecycleEvent::End, move || order.lock().unwrap().push(i));
        }
        lc.emit(LifecycleEvent::End);

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn emit_only_reaches_matching_event() {
        let lc = Lifecycle::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        lc.subscribe(LifecycleEvent::Online, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        lc.emit(LifecycleEvent::Offline);
        lc.emit(LifecycleEvent::Online);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
