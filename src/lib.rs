// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! An enclave page cache: allocation, LRU tracking, reclamation, and
//! teardown of the fixed pool of EPC pages that back isolated execution
//! environments. The pool is enumerated by the embedder at construction;
//! pages leave it only through the privileged writeback protocol and
//! return through the free lists.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use static_assertions::const_assert;

#[cfg(feature = "cgroup")]
use spin::Mutex as SpinMutex;
#[cfg(feature = "cgroup")]
use std::sync::Weak;

pub mod cgroup;
pub mod encl;
pub mod hw;
pub mod sched;

mod lru;
mod oom;
mod page;
mod reclaim;
mod section;
mod swapd;

#[cfg(test)]
pub(crate) mod testutil;

pub use cgroup::EpcCgroup;
pub use epc_pages::{CpuSet, EpcAddr, PageId, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE};
pub use oom::oom_zap;
pub use page::{PageClass, PageOwner};
pub use section::SectionConfig;

use hw::{EpcHw, IpiOps};
use lru::LruScope;
use page::{EpcPage, PageState, ReclaimState};
use sched::SchedHooks;
use section::SectionTable;
use swapd::SwapdCtl;

/// Pages scanned per reclaim invocation.
pub const NR_TO_SCAN: usize = 16;
/// Upper bound on pages written back in one pass.
pub const MAX_NR_TO_RECLAIM: usize = 32;
/// Upper bound on hardware-enumerated EPC sections.
pub const MAX_EPC_SECTIONS: usize = 8;

const_assert!(NR_TO_SCAN <= MAX_NR_TO_RECLAIM);

/// Errors surfaced by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No free page and nothing left to reclaim.
    OutOfMemory,
    /// The caller may not block, or the page is owned by the reclaimer.
    Busy,
    /// A cancellation signal is pending.
    Interrupted,
    /// A hardware primitive or internal state check failed unexpectedly.
    Inconsistent,
}

pub type Result<T> = core::result::Result<T, Error>;

/// Free-page watermarks, in pages. Allocation wakes the background thread
/// below `nr_low_pages`; the thread reclaims until `nr_high_pages` free.
#[derive(Debug, Clone, Copy)]
pub struct EpcParams {
    pub nr_low_pages: usize,
    pub nr_high_pages: usize,
}

impl Default for EpcParams {
    fn default() -> Self {
        EpcParams {
            nr_low_pages: 32,
            nr_high_pages: 64,
        }
    }
}

pub(crate) struct RateLimit {
    count: AtomicU32,
    burst: u32,
}

impl RateLimit {
    pub const fn new(burst: u32) -> Self {
        RateLimit {
            count: AtomicU32::new(0),
            burst,
        }
    }

    pub fn allow(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) < self.burst
    }
}

/// Logs a warning at most a few times per call site; a flood of hardware
/// anomalies must not drown the log, but none may be silently swallowed.
macro_rules! warn_limited {
    ($($arg:tt)*) => {{
        static LIMIT: $crate::RateLimit = $crate::RateLimit::new(4);
        if LIMIT.allow() {
            log::warn!($($arg)*);
        }
    }};
}

pub(crate) use warn_limited;

/// The LRU scope a page belongs to: its charge group's, or the global one.
pub(crate) enum ScopeRef<'a> {
    Global(&'a LruScope),
    Cgroup(Arc<EpcCgroup>),
}

impl ScopeRef<'_> {
    pub fn lru(&self) -> &LruScope {
        match self {
            ScopeRef::Global(lru) => lru,
            ScopeRef::Cgroup(cg) => cg.lru(),
        }
    }
}

pub(crate) struct EpcInner {
    pub(crate) sections: SectionTable,
    pub(crate) global_lru: LruScope,
    pub(crate) hw: Arc<dyn EpcHw>,
    pub(crate) ipi: Arc<dyn IpiOps>,
    pub(crate) sched: Arc<dyn SchedHooks>,
    pub(crate) params: EpcParams,
    pub(crate) swapd: SwapdCtl,
    #[cfg(feature = "cgroup")]
    pub(crate) cgroups: SpinMutex<Vec<Weak<EpcCgroup>>>,
}

impl EpcInner {
    fn scope_of(&self, page: &EpcPage) -> ScopeRef<'_> {
        match page.meta().cgroup.clone() {
            Some(cg) => ScopeRef::Cgroup(cg),
            None => ScopeRef::Global(&self.global_lru),
        }
    }

    pub(crate) fn record_page(&self, id: PageId, class: PageClass) {
        let page = self.sections.page(id);
        self.scope_of(page).lru().record(id, page, class);
    }

    pub(crate) fn drop_page(&self, id: PageId) -> Result<()> {
        let page = self.sections.page(id);
        self.scope_of(page).lru().drop_page(id, page)
    }

    /// Hardware-removes the page and returns it to its section. The page
    /// must hold no reclaim state; a violation is logged and the free is
    /// refused rather than corrupting the pool.
    pub(crate) fn free_page(&self, id: PageId) {
        let page = self.sections.page(id);
        let state = page.state();
        if state != PageState::InUse(ReclaimState::Untracked) {
            log::warn!(
                "epc: free of {:?} ({:?}) in state {:?}",
                id,
                page.phys_addr(),
                state
            );
            return;
        }
        if let Err(err) = self.hw.remove(self.sections.epc_addr(id)) {
            warn_limited!("epc: REMOVE failed freeing {:?}: {:?}", id, err);
            return;
        }
        self.sections.release(id);
    }

    /// Returns a page whose hardware removal is already proven (a written
    /// back or never-initialized page) to its section.
    pub(crate) fn release_page(&self, id: PageId) {
        self.sections.release(id);
    }

    fn alloc_page_scoped(
        &self,
        owner: PageOwner,
        may_reclaim: bool,
        cg: Option<&Arc<EpcCgroup>>,
    ) -> Result<PageId> {
        loop {
            if let Some(id) = self.sections.try_alloc() {
                {
                    let mut meta = self.sections.page(id).meta();
                    meta.owner = Some(owner);
                    meta.cgroup = cg.cloned();
                }
                if self.should_reclaim(self.params.nr_low_pages) {
                    self.wake_swapd();
                }
                return Ok(id);
            }
            if !self.can_reclaim() {
                return Err(Error::OutOfMemory);
            }
            if !may_reclaim {
                return Err(Error::Busy);
            }
            if self.sched.signal_pending() {
                return Err(Error::Interrupted);
            }
            self.do_reclaim(NR_TO_SCAN, false, cg);
        }
    }
}

/// The cache itself: section table, global LRU, background thread, and the
/// seams to the hardware and the scheduler. One instance per system,
/// constructed at init and torn down on drop.
pub struct EpcCache {
    inner: Arc<EpcInner>,
    swapd_thread: Option<JoinHandle<()>>,
}

impl EpcCache {
    /// Builds the cache over the enumerated `sections` and starts the
    /// background thread. Pages become allocatable as sanitization
    /// progresses.
    pub fn new(
        params: EpcParams,
        sections: &[SectionConfig],
        hw: Arc<dyn EpcHw>,
        ipi: Arc<dyn IpiOps>,
        sched: Arc<dyn SchedHooks>,
    ) -> Result<Self> {
        if params.nr_low_pages > params.nr_high_pages {
            return Err(Error::Inconsistent);
        }
        let inner = Arc::new(EpcInner {
            sections: SectionTable::new(sections)?,
            global_lru: LruScope::new(),
            hw,
            ipi,
            sched,
            params,
            swapd: SwapdCtl::new(),
            #[cfg(feature = "cgroup")]
            cgroups: SpinMutex::new(Vec::new()),
        });
        log::info!(
            "epc: {} pages in {} sections",
            inner.sections.total_pages(),
            sections.len()
        );

        let thread_inner = inner.clone();
        let swapd_thread = std::thread::Builder::new()
            .name("epc-swapd".into())
            .spawn(move || thread_inner.swapd_loop())
            .map_err(|_| Error::OutOfMemory)?;

        Ok(EpcCache {
            inner,
            swapd_thread: Some(swapd_thread),
        })
    }

    pub(crate) fn inner(&self) -> &EpcInner {
        &self.inner
    }

    /// Allocates a page bound to `owner`, reclaiming synchronously when
    /// the pool is exhausted and `may_reclaim` permits. No lock the
    /// reclaimer needs may be held when `may_reclaim` is set.
    pub fn alloc_page(&self, owner: PageOwner, may_reclaim: bool) -> Result<PageId> {
        self.inner.alloc_page_scoped(owner, may_reclaim, None)
    }

    /// As `alloc_page`, charging `cg` first; charge failure is reported
    /// with the same error taxonomy.
    #[cfg(feature = "cgroup")]
    pub fn alloc_page_charged(
        &self,
        owner: PageOwner,
        may_reclaim: bool,
        cg: &Arc<EpcCgroup>,
    ) -> Result<PageId> {
        self.inner.try_charge(cg, may_reclaim)?;
        match self.inner.alloc_page_scoped(owner, may_reclaim, Some(cg)) {
            Ok(id) => Ok(id),
            Err(err) => {
                cg.uncharge();
                Err(err)
            }
        }
    }

    /// Executes the hardware remove primitive and returns the page to its
    /// section's free list.
    pub fn free_page(&self, id: PageId) {
        self.inner.free_page(id);
    }

    /// Returns a page whose removal is already proven to its section's
    /// free list.
    pub fn release_page(&self, id: PageId) {
        self.inner.release_page(id);
    }

    /// Starts LRU tracking for an in-use page.
    pub fn record_page(&self, id: PageId, class: PageClass) {
        self.inner.record_page(id, class);
    }

    /// Stops LRU tracking. Fails with `Busy` while the reclaimer owns the
    /// page.
    pub fn drop_page(&self, id: PageId) -> Result<()> {
        self.inner.drop_page(id)
    }

    /// Runs one reclaim pass over the global scope. Returns the number of
    /// pages written back and freed.
    pub fn reclaim_pages(&self, nr_to_scan: usize, ignore_age: bool) -> usize {
        self.inner.do_reclaim(nr_to_scan, ignore_age, None)
    }

    /// Runs one reclaim pass confined to `cg`'s scope.
    #[cfg(feature = "cgroup")]
    pub fn reclaim_pages_in(&self, cg: &Arc<EpcCgroup>, nr_to_scan: usize, ignore_age: bool) -> usize {
        self.inner.do_reclaim(nr_to_scan, ignore_age, Some(cg))
    }

    /// Out-of-memory handling on the global scope: picks a victim from the
    /// unreclaimable list and tears its owner down. Returns whether a
    /// victim was found.
    pub fn oom(&self) -> bool {
        self.inner.do_oom(None)
    }

    /// Out-of-memory handling confined to `cg`'s scope.
    #[cfg(feature = "cgroup")]
    pub fn oom_in(&self, cg: &Arc<EpcCgroup>) -> bool {
        self.inner.do_oom(Some(cg))
    }

    /// Creates and registers a charge group node.
    #[cfg(feature = "cgroup")]
    pub fn new_cgroup(&self, parent: Option<&Arc<EpcCgroup>>, limit: usize) -> Arc<EpcCgroup> {
        let cg = EpcCgroup::new(parent, limit);
        self.inner.register_cgroup(&cg);
        cg
    }

    /// Best-effort count of free pages across all sections.
    pub fn nr_free_pages(&self) -> usize {
        self.inner.nr_free_pages()
    }

    /// Blocks until boot sanitization has finished, up to `timeout`.
    pub fn wait_until_sanitized(&self, timeout: Duration) -> bool {
        self.inner.wait_until_sanitized(timeout)
    }

    /// Stops the background thread. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.inner.swapd.request_stop();
        if let Some(handle) = self.swapd_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpcCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
