//! Page visibility and time, as capabilities the handoff can be given.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chathandoff_core::{Clock, Visibility};
use tokio::{sync::mpsc, time::Instant};

pub trait VisibilitySource: Send + Sync {
    /// A fresh listener. It starts from the current value and then receives every later
    /// change, in order. Dropping the listener is how it is removed.
    fn subscribe(&self) -> VisibilityListener;
}

/// One subscriber's view of the page. Changes queue up per listener, so a short
/// hidden/visible/hidden flap is seen as three transitions, never merged into one.
#[derive(Debug)]
pub struct VisibilityListener {
    current: Visibility,
    rx: mpsc::UnboundedReceiver<Visibility>,
}

impl VisibilityListener {
    /// The last value this listener has seen.
    pub fn current(&self) -> Visibility {
        self.current
    }

    /// The next change. `None` once the source is gone. Cancel-safe.
    pub async fn changed(&mut self) -> Option<Visibility> {
        let next = self.rx.recv().await?;
        self.current = next;
        Some(next)
    }
}

#[derive(Debug)]
struct PageState {
    current: Visibility,
    listeners: Vec<mpsc::UnboundedSender<Visibility>>,
}

/// Visibility of the hosting page, fed by whatever observes the real page.
#[derive(Debug)]
pub struct PageVisibility {
    state: Mutex<PageState>,
}

impl PageVisibility {
    pub fn new(initial: Visibility) -> Self {
        Self {
            state: Mutex::new(PageState {
                current: initial,
                listeners: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PageState> {
        // The state is two plain fields; a panic mid-update cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Visibility {
        self.state().current
    }

    /// Publish a new state. Repeats of the current state notify nobody.
    pub fn set(&self, visibility: Visibility) {
        let mut state = self.state();
        if state.current == visibility {
            return;
        }
        state.current = visibility;
        state
            .listeners
            .retain(|listener| listener.send(visibility).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        let mut state = self.state();
        state.listeners.retain(|listener| !listener.is_closed());
        state.listeners.len()
    }
}

impl Default for PageVisibility {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

impl VisibilitySource for PageVisibility {
    fn subscribe(&self) -> VisibilityListener {
        let mut state = self.state();
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.push(tx);
        VisibilityListener {
            current: state.current,
            rx,
        }
    }
}

/// Milliseconds since construction on tokio's clock, so paused test time drives it too.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis())
            .unwrap_or(u64::MAX)
    }
}
