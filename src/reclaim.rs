// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The reclaimer. A pass isolates a batch of pages from the LRU, ages out
//! the ones that were touched recently, blocks the rest, and writes them
//! back to their enclaves' backing storage through the hardware writeback
//! protocol. Written pages return to their sections' free lists.

use std::sync::Arc;

use epc_pages::PAGE_SIZE;

use crate::cgroup::EpcCgroup;
use crate::encl::{
    alloc_va_slot, Backing, BackingStore, EnclFlags, EnclInner, EnclPage, Enclave, VmSpace,
};
use crate::hw::{EpcHw, HwError, IpiOps, PageInfo};
use crate::lru::IsolatedPage;
use crate::page::{PageState, ReclaimState};
use crate::sched::SchedHooks;
use crate::warn_limited;
use crate::{EpcInner, Error, Result, MAX_NR_TO_RECLAIM};

/// An isolated page that passed aging and has backing storage pinned.
struct ReclaimEntry {
    cand: IsolatedPage,
    backing: Backing,
}

impl EpcInner {
    /// One reclaim pass: scans up to `nr_to_scan` pages (clamped to
    /// `MAX_NR_TO_RECLAIM`) from `scope`, or from the global scope plus
    /// the charge-group overlay when no scope is given. Returns the number
    /// of pages actually written back and freed.
    ///
    /// Per-page failures never fail the pass: a young page, a page whose
    /// backing cannot be obtained, or a page whose writeback errors out is
    /// returned to the tail of its LRU and the pass continues.
    pub(crate) fn do_reclaim(
        &self,
        nr_to_scan: usize,
        ignore_age: bool,
        scope: Option<&Arc<EpcCgroup>>,
    ) -> usize {
        let mut want = nr_to_scan.min(MAX_NR_TO_RECLAIM);
        let mut iso: Vec<IsolatedPage> = Vec::with_capacity(want);

        match scope {
            Some(cg) => cg.lru().isolate(&self.sections, &mut want, &mut iso),
            None => {
                // Anything on the global list is reclaimed first even when
                // charge groups are in play.
                self.global_lru.isolate(&self.sections, &mut want, &mut iso);
                #[cfg(feature = "cgroup")]
                self.isolate_cgroups(&mut want, &mut iso);
            }
        }

        if iso.is_empty() {
            self.sched.cond_resched();
            return 0;
        }

        // Phase A: age the batch and pin backing storage. Pages that fail
        // either step go back to their LRU tails.
        let mut accepted: Vec<ReclaimEntry> = Vec::with_capacity(iso.len());
        for cand in iso {
            if accepted.len() == MAX_NR_TO_RECLAIM || (!ignore_age && self.page_is_young(&cand)) {
                self.return_to_lru(cand);
                continue;
            }
            let index = cand.page.backing_index(&cand.encl);
            let backing = match cand.encl.backing().get_backing(index) {
                Ok(backing) => backing,
                Err(_) => {
                    self.return_to_lru(cand);
                    continue;
                }
            };
            {
                // Concurrent faults serialized on the enclave lock see the
                // eviction marker before the mappings go away.
                let _inner = cand.encl.lock();
                cand.page.set_reclaimed(true);
            }
            accepted.push(ReclaimEntry { cand, backing });
        }

        // Phase B: tear down the mappings and block each page.
        for entry in &accepted {
            self.reclaimer_block(&entry.cand);
        }

        // Phase C: track and write.
        let mut reclaimed = 0;
        for entry in accepted {
            match self.reclaimer_write(&entry) {
                Ok(()) => {
                    entry.cand.encl.backing().put_backing(entry.backing, true);
                    let page = self.sections.page(entry.cand.id);
                    page.meta().state = PageState::InUse(ReclaimState::Untracked);
                    self.sections.release(entry.cand.id);
                    reclaimed += 1;
                }
                Err(_) => {
                    entry.cand.encl.backing().put_backing(entry.backing, false);
                    self.return_to_lru(entry.cand);
                }
            }
        }

        self.sched.cond_resched();
        reclaimed
    }

    /// A page is young if any mapping's accessed bit was set since the last
    /// scan, unless the enclave is already finished and the page will never
    /// be touched again.
    fn page_is_young(&self, cand: &IsolatedPage) -> bool {
        let addr = cand.page.addr();
        let mut young = false;
        cand.encl.mm_list().for_each(|mm| {
            if mm.test_and_clear_young(addr) {
                young = true;
            }
            !young && !cand.encl.flags().dead_or_oom()
        });
        young && !cand.encl.flags().dead_or_oom()
    }

    /// Ends the reclaimer's ownership of an isolated page: back to the LRU
    /// tail, strong enclave reference released on drop.
    fn return_to_lru(&self, cand: IsolatedPage) {
        let page = self.sections.page(cand.id);
        let scope = self.scope_of(page);
        scope.lru().return_tail(cand.id, page);
    }

    /// Phase B for one page: zap every linear mapping of the page, then
    /// BLOCK it. The mapping walk re-runs while address spaces are being
    /// added. BLOCK is skipped only for a fully dead enclave.
    fn reclaimer_block(&self, cand: &IsolatedPage) {
        let addr = cand.page.addr();
        cand.encl
            .mm_list()
            .walk_stable(|mm| mm.zap_range(addr, addr + PAGE_SIZE));

        let _inner = cand.encl.lock();
        if !cand.encl.flags().contains(EnclFlags::DEAD) {
            if let Err(err) = self.hw.block(self.sections.epc_addr(cand.id)) {
                warn_limited!("epc: BLOCK failed: {:?}", err);
            }
        }
    }

    /// Phase C for one page. On success the page has left the enclave:
    /// the version slot is attached, the child count drops, and the SECS
    /// epilogue runs when the last child leaves.
    fn reclaimer_write(&self, entry: &ReclaimEntry) -> Result<()> {
        let encl = &entry.cand.encl;
        let page = &entry.cand.page;
        let mut inner = encl.lock();

        let result = if encl.flags().contains(EnclFlags::DEAD) {
            // No state left to preserve; the page is removed, not written.
            page.set_reclaimed(false);
            if let Err(err) = self.hw.remove(self.sections.epc_addr(entry.cand.id)) {
                warn_limited!("epc: REMOVE of dead enclave page failed: {:?}", err);
            }
            Ok(())
        } else {
            self.writeback_page(encl, &mut inner, page, &entry.backing)
        };

        if result.is_ok() {
            page.take_epc();
            inner.child_cnt = inner.child_cnt.saturating_sub(1);
            if inner.child_cnt == 0 {
                self.write_secs(encl, &mut inner);
            }
        }
        result
    }

    /// The hardware writeback protocol for one page: allocate a version
    /// slot, WRITEBACK, and on `NotTracked` escalate — TRACK the enclave's
    /// secrets page, retry, then kick the enclave's CPUs and retry once
    /// more. Any other failure releases the slot and abandons the page for
    /// this pass.
    fn writeback_page(
        &self,
        encl: &Enclave,
        inner: &mut EnclInner,
        page: &EnclPage,
        backing: &Backing,
    ) -> Result<()> {
        page.set_reclaimed(false);
        let id = page.epc().ok_or(Error::Inconsistent)?;
        let epc = self.sections.epc_addr(id);
        let slot = alloc_va_slot(inner)?;
        let va_addr = self.sections.epc_addr(slot.va_page.epc()) + slot.slot * 8;
        let info = PageInfo {
            addr: 0,
            secs: 0,
            contents: backing.contents,
            metadata: backing.metadata,
        };

        let mut result = self.hw.writeback(&info, epc, va_addr);
        if result == Err(HwError::NotTracked) {
            if let Some(secs) = inner.secs.as_ref().and_then(|secs| secs.epc()) {
                if let Err(err) = self.hw.track(self.sections.epc_addr(secs)) {
                    warn_limited!("epc: TRACK failed: {:?}", err);
                }
            }
            result = self.hw.writeback(&info, epc, va_addr);
            if result == Err(HwError::NotTracked) {
                // The mask must be built after TRACK, or a CPU entering
                // between mask generation and the epoch bump is missed.
                self.ipi.ipi_on(&encl.cpu_mask());
                result = self.hw.writeback(&info, epc, va_addr);
            }
        }

        match result {
            Ok(()) => {
                page.set_va_slot(slot);
                Ok(())
            }
            Err(err) => {
                slot.va_page.free_slot(slot.slot);
                warn_limited!("epc: WRITEBACK failed: {:?}", err);
                Err(Error::Inconsistent)
            }
        }
    }

    /// Runs when an enclave's last child leaves: a dead enclave's secrets
    /// page is removed and freed; an initialized one's is written back and
    /// released.
    fn write_secs(&self, encl: &Enclave, inner: &mut EnclInner) {
        let flags = encl.flags();
        let secs = match inner.secs.clone() {
            Some(secs) => secs,
            None => return,
        };
        let id = match secs.epc() {
            Some(id) => id,
            None => return,
        };

        if flags.contains(EnclFlags::DEAD) {
            secs.take_epc();
            if self.drop_page(id).is_ok() {
                self.free_page(id);
            }
        } else if flags.contains(EnclFlags::INITIALIZED) {
            let index = encl.size() / PAGE_SIZE;
            let backing = match encl.backing().get_backing(index) {
                Ok(backing) => backing,
                Err(_) => return,
            };
            match self.writeback_page(encl, inner, &secs, &backing) {
                Ok(()) => {
                    secs.take_epc();
                    if self.drop_page(id).is_ok() {
                        // Writeback already evicted the page; release only.
                        let page = self.sections.page(id);
                        page.meta().state = PageState::InUse(ReclaimState::Untracked);
                        self.sections.release(id);
                    }
                    encl.backing().put_backing(backing, true);
                }
                Err(_) => {
                    encl.backing().put_backing(backing, false);
                }
            }
        }
    }
}
