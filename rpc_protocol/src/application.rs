// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide state shared by every Command Invoker, Command Executor, and Telemetry
//! sender/receiver in an application: a single hybrid logical clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::hybrid_logical_clock::{HybridLogicalClock, DEFAULT_MAX_CLOCK_DRIFT};
use crate::error::RpcError;

/// The application-wide [`HybridLogicalClock`], guarded for concurrent access.
pub struct ApplicationHybridLogicalClock {
    hlc: Mutex<HybridLogicalClock>,
    max_clock_drift: Duration,
}

impl ApplicationHybridLogicalClock {
    /// Creates a new clock, starting at the current time, with the given maximum allowed drift.
    #[must_use]
    pub fn new(max_clock_drift: Duration) -> Self {
        Self {
            hlc: Mutex::new(HybridLogicalClock::new()),
            max_clock_drift,
        }
    }

    /// Returns a snapshot of the current clock value.
    #[must_use]
    pub fn read(&self) -> HybridLogicalClock {
        self.hlc.lock().expect("hlc mutex poisoned").clone()
    }

    /// Merges a clock value observed on an incoming message into the application clock.
    ///
    /// # Errors
    /// Propagates [`HybridLogicalClock::update`]'s errors: counter overflow
    /// (`InternalLogicError`) or excessive drift from wall-clock time (`StateInvalid`).
    pub(crate) fn update(&self, other_hlc: &HybridLogicalClock) -> Result<(), RpcError> {
        self.hlc.lock().expect("hlc mutex poisoned").update(other_hlc, self.max_clock_drift)
    }

    /// Advances the application clock to the current time (or increments its counter if it is
    /// already ahead) and returns the wire representation to stamp on an outgoing message.
    ///
    /// # Errors
    /// Propagates [`HybridLogicalClock::update_now`]'s errors.
    pub(crate) fn update_now(&self) -> Result<String, RpcError> {
        let mut hlc = self.hlc.lock().expect("hlc mutex poisoned");
        hlc.update_now(self.max_clock_drift)?;
        Ok(hlc.to_string())
    }
}

/// Options for creating an [`ApplicationContext`].
#[derive(Builder)]
#[builder(setter(into))]
pub struct ApplicationContextOptions {
    /// The maximum clock drift tolerated between the local clock and a remote one.
    #[builder(default = "DEFAULT_MAX_CLOCK_DRIFT")]
    pub max_clock_drift: Duration,
}

/// Shared, process-wide context. Construct exactly one per application (not per session): every
/// Invoker, Executor, Sender, and Receiver built against the same application should reference
/// the same `ApplicationContext` so they stamp `__ts` from a single clock.
#[derive(Clone)]
pub struct ApplicationContext {
    /// The application's hybrid logical clock.
    pub application_hlc: Arc<ApplicationHybridLogicalClock>,
}

impl ApplicationContext {
    /// Creates a new context from the given options.
    #[must_use]
    pub fn new(options: ApplicationContextOptions) -> Self {
        Self {
            application_hlc: Arc::new(ApplicationHybridLogicalClock::new(options.max_clock_drift)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_now_advances_clock_and_returns_its_display() {
        let ctx = ApplicationContext::new(ApplicationContextOptionsBuilder::default().build().unwrap());
        let rendered = ctx.application_hlc.update_now().unwrap();
        assert_eq!(rendered, ctx.application_hlc.read().to_string());
    }
}
