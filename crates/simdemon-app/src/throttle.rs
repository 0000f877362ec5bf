//! Leading + trailing edge throttle
//!
//! The first call fires immediately. Calls within the interval are coalesced
//! and the latest value is delivered once the interval has elapsed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct State<T> {
    last_fire: Option<Instant>,
    pending: Option<T>,
    timer_scheduled: bool,
    cancelled: bool,
}

/// Cloneable throttled callback
pub struct Throttle<T> {
    interval: Duration,
    callback: Callback<T>,
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Throttle<T> {
    fn clone(&self) -> Self {
        Self {
            interval: self.interval,
            callback: Arc::clone(&self.callback),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Throttle<T> {
    pub fn new(interval: Duration, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            interval,
            callback: Arc::new(callback),
            state: Arc::new(Mutex::new(State {
                last_fire: None,
                pending: None,
                timer_scheduled: false,
                cancelled: false,
            })),
        }
    }

    pub fn call(&self, value: T) {
        let now = Instant::now();
        let mut value = Some(value);
        let fire_at = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.cancelled {
                return;
            }

            let ready = state
                .last_fire
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            if ready && !state.timer_scheduled {
                state.last_fire = Some(now);
                None
            } else {
                state.pending = value.take();
                if state.timer_scheduled {
                    return;
                }
                state.timer_scheduled = true;
                let last = state.last_fire.unwrap_or(now);
                Some(last + self.interval)
            }
        };

        match (fire_at, value) {
            (None, Some(value)) => (self.callback)(value),
            (Some(deadline), _) => self.schedule_trailing(deadline),
            (None, None) => {}
        }
    }

    fn schedule_trailing(&self, deadline: Instant) {
        let this = self.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime there is nothing to wake us up later
            this.flush();
            return;
        };

        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.flush();
        });
    }

    /// Deliver a pending trailing value now
    pub fn flush(&self) {
        let value = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.timer_scheduled = false;
            if state.cancelled {
                return;
            }
            let value = state.pending.take();
            if value.is_some() {
                state.last_fire = Some(Instant::now());
            }
            value
        };

        if let Some(value) = value {
            (self.callback)(value);
        }
    }

    /// Drop any pending value and ignore future calls
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cancelled = true;
        state.pending = None;
    }
}
