use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Clear,
    Requested,
    Completed,
}

/// Cooperative stop flag shared between a running job and `cancel`.
#[derive(Debug)]
pub struct StopSignal {
    state: watch::Sender<StopState>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(StopState::Clear);
        Self { state }
    }

    pub fn state(&self) -> StopState {
        *self.state.borrow()
    }

    pub fn is_requested(&self) -> bool {
        self.state() == StopState::Requested
    }

    /// Resets the flag at the start of a job.
    pub fn clear(&self) {
        self.state.send_replace(StopState::Clear);
    }

    /// Moves `Clear` to `Requested`. Repeated requests change nothing.
    pub fn request(&self) -> watch::Receiver<StopState> {
        self.state.send_if_modified(|state| {
            if *state == StopState::Clear {
                *state = StopState::Requested;
                true
            } else {
                false
            }
        });
        self.state.subscribe()
    }

    /// Acknowledges a pending request. Returns whether one was pending.
    pub fn complete(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == StopState::Requested {
                *state = StopState::Completed;
                true
            } else {
                false
            }
        })
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for the running job to acknowledge a stop request.
pub async fn wait_completed(mut receiver: watch::Receiver<StopState>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| *state == StopState::Completed)
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transitions() {
        let signal = StopSignal::new();
        assert_eq!(signal.state(), StopState::Clear);
        assert!(!signal.complete());

        signal.request();
        signal.request();
        assert!(signal.is_requested());

        assert!(signal.complete());
        assert_eq!(signal.state(), StopState::Completed);

        signal.request();
        assert_eq!(signal.state(), StopState::Completed);

        signal.clear();
        assert_eq!(signal.state(), StopState::Clear);
    }

    #[tokio::test]
    async fn test_wait_sees_completion() {
        let signal = Arc::new(StopSignal::new());
        let receiver = signal.request();

        let worker = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                signal.complete();
            })
        };

        assert!(wait_completed(receiver, Duration::from_secs(5)).await);
        let _ = worker.await;
    }

    #[tokio::test]
    async fn test_wait_times_out_without_acknowledgement() {
        let signal = StopSignal::new();
        let receiver = signal.request();

        assert!(!wait_completed(receiver, Duration::from_millis(20)).await);
        assert_eq!(signal.state(), StopState::Requested);
    }
}
