// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Scheduling hooks: cancellation checks before blocking retries and
//! cooperative yields at pass boundaries.

/// Hooks into the embedding environment's scheduler.
pub trait SchedHooks: Send + Sync {
    /// Whether a cancellation signal is pending for the current task.
    /// Allocation surfaces `Interrupted` instead of retrying when it is.
    fn signal_pending(&self) -> bool {
        false
    }

    /// Cooperative yield, invoked after each reclaim or sanitize pass.
    fn cond_resched(&self) {
        std::thread::yield_now();
    }
}

/// Default hooks: never cancelled, yields to the OS scheduler.
pub struct NopSched;

impl SchedHooks for NopSched {}
