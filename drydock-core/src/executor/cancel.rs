//! A single global cancellation token, writable by any node on fatal
//! failure and by the entry point on external interrupt (spec §5, §9).

use tokio::sync::watch;

/// The cancellation token's payload: whether it has fired, and the
/// `signal`/`timeout_ms` it was fired with. Written atomically on first
/// trigger; later triggers are no-ops (first cause wins).
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelState {
    pub triggered: bool,
    pub signal: i64,
    pub timeout_ms: i64,
}

/// Cheaply cloneable; every clone observes the same underlying state.
#[derive(Clone)]
pub struct GlobalCancellation {
    tx: watch::Sender<CancelState>,
    rx: watch::Receiver<CancelState>,
}

impl GlobalCancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(CancelState::default());
        GlobalCancellation { tx, rx }
    }

    /// Fire the token. Only the first call has any effect.
    pub fn trigger(&self, signal: i64, timeout_ms: i64) {
        self.tx.send_if_modified(|state| {
            if state.triggered {
                false
            } else {
                *state = CancelState {
                    triggered: true,
                    signal,
                    timeout_ms,
                };
                true
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().triggered
    }

    pub fn state(&self) -> CancelState {
        *self.rx.borrow()
    }

    /// Resolves once the token has fired. Used to race against a task's
    /// completion (spec §4.E step 9).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.borrow().triggered {
            return;
        }
        let _ = rx.wait_for(|state| state.triggered).await;
    }
}

impl Default for GlobalCancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_triggered() {
        let token = GlobalCancellation::new();
        token.trigger(9, 0);
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn first_trigger_wins() {
        let token = GlobalCancellation::new();
        token.trigger(2, 100);
        token.trigger(9, 0);
        let state = token.state();
        assert_eq!(state.signal, 2);
        assert_eq!(state.timeout_ms, 100);
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters_on_trigger() {
        let token = GlobalCancellation::new();
        let waiter_token = token.clone();
        let handle = tokio::spawn(async move {
            waiter_token.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.trigger(9, 0);
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("waiter should observe the trigger")
            .unwrap();
    }
}
