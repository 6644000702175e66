//! Bootstrap watchdog
//!
//! One timer per start cycle. When it fires before a circuit is established
//! the supervisor decides how to recover (see [`diagnose`]) and tells the
//! host the connection is struggling.

use crate::error::Result;
use crate::tor::TorController;
use crate::util::timer::DelayedTask;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Recovery step taken when bootstrap stalls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallAction {
    /// Flip DisableNetwork to force fresh directory and guard connections
    ToggleNetwork,
    /// Leave the daemon alone; only notify the host
    NotifyOnly,
}

/// Choose a recovery step. Toggling the network would drop an already
/// negotiated bridge session, so bridge users only get the notification.
pub fn diagnose(bridges_configured: bool) -> StallAction {
    if bridges_configured {
        StallAction::NotifyOnly
    } else {
        StallAction::ToggleNetwork
    }
}

/// DisableNetwork=1 followed by DisableNetwork=0
pub async fn toggle_network(controller: &TorController) -> Result<()> {
    info!("Bootstrap stalled, toggling DisableNetwork");
    controller
        .set_conf(&[("DisableNetwork".to_string(), "1".to_string())])
        .await?;
    controller
        .set_conf(&[("DisableNetwork".to_string(), "0".to_string())])
        .await
}

/// Owns the single pending watchdog timer
#[derive(Debug)]
pub struct RetrySupervisor {
    delay: Duration,
    timer: Mutex<Option<DelayedTask>>,
}

impl RetrySupervisor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timer: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Replace any pending timer with one that runs `on_stall`
    pub fn arm<F>(&self, on_stall: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.cancel();
        }
        debug!("Bootstrap watchdog armed for {:?}", self.delay);
        *timer = Some(DelayedTask::schedule(self.delay, on_stall));
    }

    pub fn cancel(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.cancel();
            debug!("Bootstrap watchdog cancelled");
        }
    }

    /// A timer is pending and has not fired yet
    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}
