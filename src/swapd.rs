// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The background thread. At startup it sanitizes the pool: every page is
//! run through the hardware remove primitive until it reaches a defined
//! uninitialized state, in two passes so parent pages whose children still
//! exist succeed the second time around. Afterwards it sleeps until the
//! free-page count falls under the high watermark and reclaims.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::hw::EpcHw;
use crate::page::PageState;
use crate::sched::SchedHooks;
use crate::section::Section;
use crate::{EpcInner, NR_TO_SCAN};

pub(crate) struct SwapdCtl {
    state: Mutex<SwapdState>,
    cv: Condvar,
}

struct SwapdState {
    stop: bool,
    sanitized: bool,
}

impl SwapdCtl {
    pub fn new() -> Self {
        SwapdCtl {
            state: Mutex::new(SwapdState {
                stop: false,
                sanitized: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn request_stop(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop = true;
        self.cv.notify_all();
    }

    pub fn wake(&self) {
        // Taken and released so a wake cannot slip between the thread's
        // watermark check and its wait.
        drop(self.state.lock().unwrap_or_else(PoisonError::into_inner));
        self.cv.notify_all();
    }

    fn stopped(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stop
    }
}

impl EpcInner {
    pub(crate) fn nr_free_pages(&self) -> usize {
        self.sections.nr_free_pages()
    }

    pub(crate) fn can_reclaim(&self) -> bool {
        if !self.global_lru.is_reclaimable_empty() {
            return true;
        }
        #[cfg(feature = "cgroup")]
        if self.cgroups_have_candidates() {
            return true;
        }
        false
    }

    pub(crate) fn should_reclaim(&self, watermark: usize) -> bool {
        self.nr_free_pages() < watermark && self.can_reclaim()
    }

    pub(crate) fn wake_swapd(&self) {
        self.swapd.wake();
    }

    /// Blocks until boot sanitization has finished. Returns `false` on
    /// timeout.
    pub(crate) fn wait_until_sanitized(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self
            .swapd
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !state.sanitized {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .swapd
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        true
    }

    /// Drains a section's unsanitized list through the remove primitive.
    /// Pages that fail are parked for the next pass; they are presumed
    /// parents whose children still existed.
    fn sanitize_section(&self, section: &Section) {
        loop {
            if self.swapd.stopped() {
                return;
            }
            let index = {
                let mut lists = section.lists();
                lists.unsanitized.pop_front()
            };
            let index = match index {
                Some(index) => index,
                None => break,
            };
            match self.hw.remove(section.epc_addr(index)) {
                Ok(()) => {
                    let mut lists = section.lists();
                    section.page(index).meta().state = PageState::Free;
                    lists.free.push_back(index);
                    lists.free_cnt += 1;
                }
                Err(_) => {
                    section.lists().parked.push_back(index);
                }
            }
            self.sched.cond_resched();
        }
    }

    /// Two sanitization passes over every section. Pages still unsanitized
    /// after both are a fatal inconsistency; they stay parked and are never
    /// handed to the allocator.
    pub(crate) fn sanitize_all(&self) {
        for section in self.sections.iter() {
            self.sanitize_section(section);
        }
        for (i, section) in self.sections.iter().enumerate() {
            {
                let mut lists = section.lists();
                let parked: Vec<u32> = lists.parked.drain(..).collect();
                lists.unsanitized.extend(parked);
            }
            self.sanitize_section(section);

            let lists = section.lists();
            if !lists.unsanitized.is_empty() || !lists.parked.is_empty() {
                log::error!("epc: section {} has unsanitized pages", i);
            }
        }

        let mut state = self
            .swapd
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.sanitized = true;
        drop(state);
        self.swapd.cv.notify_all();
    }

    /// The thread body: sanitize, then sleep until shutdown or until free
    /// pages fall under the high watermark with something reclaimable
    /// around.
    pub(crate) fn swapd_loop(&self) {
        self.sanitize_all();

        loop {
            {
                let mut state = self
                    .swapd
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                while !state.stop && !self.should_reclaim(self.params.nr_high_pages) {
                    state = self
                        .swapd
                        .cv
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.stop {
                    break;
                }
            }
            self.do_reclaim(NR_TO_SCAN, false, None);
        }
    }
}
