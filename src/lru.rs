// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! LRU scopes. A scope is a pair of lists, reclaimable and unreclaimable,
//! sharing one lock: the global scope, or one per charge group. Pages are
//! recorded at the tail and isolated from the head, approximating LRU; a
//! page skipped for being young goes back to the tail.

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use epc_pages::PageId;

use crate::encl::{EnclPage, Enclave};
use crate::oom::OomVictim;
use crate::page::{EpcPage, PageClass, PageOwner, PageState, ReclaimState};
use crate::section::SectionTable;
use crate::{Error, Result};

/// A page on the reclaimer's private hand-off list. Holds the strong
/// enclave reference lifted during isolation, covering the writeback
/// window.
pub(crate) struct IsolatedPage {
    pub id: PageId,
    pub encl: Arc<Enclave>,
    pub page: Arc<EnclPage>,
}

pub(crate) struct LruInner {
    pub reclaimable: VecDeque<PageId>,
    pub unreclaimable: VecDeque<PageId>,
}

pub(crate) struct LruScope {
    inner: SpinMutex<LruInner>,
}

impl LruScope {
    pub fn new() -> Self {
        LruScope {
            inner: SpinMutex::new(LruInner {
                reclaimable: VecDeque::new(),
                unreclaimable: VecDeque::new(),
            }),
        }
    }

    /// Starts tracking an in-use page on the list `class` selects.
    pub fn record(&self, id: PageId, page: &EpcPage, class: PageClass) {
        let mut inner = self.inner.lock();
        let mut meta = page.meta();
        if meta.state != PageState::InUse(ReclaimState::Untracked) {
            log::warn!("epc: recording {:?} with reclaim state {:?}", id, meta.state);
        }
        match class {
            PageClass::Reclaimable => {
                meta.state = PageState::InUse(ReclaimState::Reclaimable);
                inner.reclaimable.push_back(id);
            }
            PageClass::Unreclaimable => {
                meta.state = PageState::InUse(ReclaimState::Unreclaimable);
                inner.unreclaimable.push_back(id);
            }
        }
    }

    /// Stops tracking a page. Fails with `Busy` while the reclaimer owns
    /// the page; the owner must retry after the reclaim pass settles.
    pub fn drop_page(&self, id: PageId, page: &EpcPage) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut meta = page.meta();
        match meta.state {
            PageState::InUse(ReclaimState::ReclaimInProgress) => return Err(Error::Busy),
            PageState::InUse(ReclaimState::Reclaimable) => {
                detach(&mut inner.reclaimable, id);
            }
            PageState::InUse(ReclaimState::Unreclaimable) => {
                detach(&mut inner.unreclaimable, id);
            }
            // Already off-list: isolation dropped it when the owner began
            // disappearing.
            PageState::InUse(ReclaimState::Untracked) => return Ok(()),
            state => {
                log::warn!("epc: dropping {:?} in state {:?}", id, state);
                return Ok(());
            }
        }
        meta.state = PageState::InUse(ReclaimState::Untracked);
        Ok(())
    }

    /// Moves up to `want` pages from the head of the reclaimable list to
    /// `dst`, lifting a strong reference to each page's enclave. A page
    /// whose owner is already disappearing is dropped from the list
    /// instead and does not count against `want`.
    pub fn isolate(&self, sections: &SectionTable, want: &mut usize, dst: &mut Vec<IsolatedPage>) {
        let mut inner = self.inner.lock();
        for _ in 0..inner.reclaimable.len() {
            if *want == 0 {
                break;
            }
            let id = match inner.reclaimable.pop_front() {
                Some(id) => id,
                None => break,
            };
            let page = sections.page(id);
            let mut meta = page.meta();
            let encl_page = match meta.owner.as_ref() {
                Some(PageOwner::Enclave(encl_page)) => encl_page.clone(),
                owner => {
                    log::warn!(
                        "epc: non-enclave owner ({}) on reclaimable list",
                        owner.map_or("none", |_| "other"),
                    );
                    drop(meta);
                    inner.reclaimable.push_back(id);
                    continue;
                }
            };
            match encl_page.enclave() {
                Some(encl) => {
                    meta.state = PageState::InUse(ReclaimState::ReclaimInProgress);
                    dst.push(IsolatedPage {
                        id,
                        encl,
                        page: encl_page,
                    });
                    *want -= 1;
                }
                None => {
                    // The owner is freeing the page; clear it from tracking.
                    meta.state = PageState::InUse(ReclaimState::Untracked);
                }
            }
        }
    }

    /// Returns an isolated page to the reclaimable tail, ending the
    /// reclaimer's ownership.
    pub fn return_tail(&self, id: PageId, page: &EpcPage) {
        let mut inner = self.inner.lock();
        let mut meta = page.meta();
        if meta.state != PageState::InUse(ReclaimState::ReclaimInProgress) {
            log::warn!("epc: returning {:?} in state {:?} to LRU", id, meta.state);
        }
        meta.state = PageState::InUse(ReclaimState::Reclaimable);
        inner.reclaimable.push_back(id);
    }

    /// Scans the unreclaimable list for a page whose owner can still be
    /// referenced, removing scanned pages from the list as it goes.
    pub fn pick_oom_victim(&self, sections: &SectionTable) -> Option<OomVictim> {
        let mut inner = self.inner.lock();
        while let Some(id) = inner.unreclaimable.pop_front() {
            let page = sections.page(id);
            let mut meta = page.meta();
            meta.state = PageState::InUse(ReclaimState::Untracked);
            let victim = match meta.owner.as_ref() {
                Some(PageOwner::Virt(virt)) => {
                    virt.upgrade().map(|owner| OomVictim::Virt(owner, id))
                }
                Some(owner) => owner.try_get_enclave().map(OomVictim::Encl),
                None => None,
            };
            if victim.is_some() {
                return victim;
            }
        }
        None
    }

    pub fn is_reclaimable_empty(&self) -> bool {
        self.inner.lock().reclaimable.is_empty()
    }

    #[cfg(test)]
    pub fn lens(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.reclaimable.len(), inner.unreclaimable.len())
    }

    #[cfg(test)]
    pub fn contains(&self, id: PageId) -> bool {
        let inner = self.inner.lock();
        inner.reclaimable.contains(&id) || inner.unreclaimable.contains(&id)
    }
}

fn detach(list: &mut VecDeque<PageId>, id: PageId) {
    if let Some(pos) = list.iter().position(|&entry| entry == id) {
        list.remove(pos);
    } else {
        log::warn!("epc: {:?} missing from its LRU list", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageClass;
    use crate::testutil::{self, TestPool};

    // Allocates one enclave page and returns the handles the tests poke at.
    fn tracked_page(pool: &TestPool) -> (PageId, Arc<Enclave>, Arc<EnclPage>) {
        let encl = pool.enclave(1);
        let (id, page) = pool.attach_page(&encl, 0);
        (id, encl, page)
    }

    #[test]
    fn record_then_drop_restores_state() {
        let pool = testutil::pool(&[8]);
        let (id, _encl, _page) = tracked_page(&pool);
        let inner = pool.cache.inner();

        let before = inner.sections.page(id).state();
        inner.global_lru.record(id, inner.sections.page(id), PageClass::Reclaimable);
        assert_eq!(inner.global_lru.lens(), (1, 0));
        assert!(inner.global_lru.drop_page(id, inner.sections.page(id)).is_ok());
        assert_eq!(inner.sections.page(id).state(), before);
        assert_eq!(inner.global_lru.lens(), (0, 0));
        assert!(!inner.global_lru.contains(id));
    }

    #[test]
    fn flags_agree_with_list_membership() {
        let pool = testutil::pool(&[8]);
        let (id, _encl, _page) = tracked_page(&pool);
        let inner = pool.cache.inner();

        inner.global_lru.record(id, inner.sections.page(id), PageClass::Reclaimable);
        assert_eq!(
            inner.sections.page(id).state(),
            PageState::InUse(ReclaimState::Reclaimable)
        );
        // Recorded pages are off the section free list.
        let section = inner.sections.section(id.section);
        assert!(!section.lists().free.contains(&id.index));
    }

    #[test]
    fn drop_is_busy_while_isolated() {
        let pool = testutil::pool(&[8]);
        let (id, _encl, _page) = tracked_page(&pool);
        let inner = pool.cache.inner();
        inner.global_lru.record(id, inner.sections.page(id), PageClass::Reclaimable);

        let mut want = 16;
        let mut dst = Vec::new();
        inner.global_lru.isolate(&inner.sections, &mut want, &mut dst);
        assert_eq!(dst.len(), 1);
        assert_eq!(want, 15);
        // The isolated page is on no LRU list, only the hand-off list.
        assert!(!inner.global_lru.contains(id));
        assert_eq!(
            inner.global_lru.drop_page(id, inner.sections.page(id)),
            Err(Error::Busy)
        );

        inner.global_lru.return_tail(id, inner.sections.page(id));
        assert!(inner.global_lru.drop_page(id, inner.sections.page(id)).is_ok());
    }

    #[test]
    fn isolate_skips_disappearing_owner() {
        let pool = testutil::pool(&[8]);
        let (id, encl, _page) = tracked_page(&pool);
        let inner = pool.cache.inner();
        inner.global_lru.record(id, inner.sections.page(id), PageClass::Reclaimable);
        drop(encl);

        let mut want = 16;
        let mut dst = Vec::new();
        inner.global_lru.isolate(&inner.sections, &mut want, &mut dst);
        assert!(dst.is_empty());
        assert_eq!(want, 16);
        assert!(!inner.global_lru.contains(id));
        assert_eq!(
            inner.sections.page(id).state(),
            PageState::InUse(ReclaimState::Untracked)
        );
    }

    #[test]
    fn oom_victim_comes_from_unreclaimable_list() {
        let pool = testutil::pool(&[8]);
        let encl = pool.enclave(1);
        let inner = pool.cache.inner();
        assert!(inner.global_lru.pick_oom_victim(&inner.sections).is_none());

        let va_id = pool.attach_va_page(&encl);
        match inner.global_lru.pick_oom_victim(&inner.sections) {
            Some(OomVictim::Encl(victim)) => assert!(Arc::ptr_eq(&victim, &encl)),
            other => panic!("unexpected victim: {:?}", other.is_some()),
        }
        assert_eq!(inner.global_lru.lens(), (0, 0));
        assert_eq!(
            inner.sections.page(va_id).state(),
            PageState::InUse(ReclaimState::Untracked)
        );
    }

    #[test]
    fn concurrent_drop_and_isolate_settle_one_winner() {
        for _ in 0..64 {
            let pool = testutil::pool(&[8]);
            let (id, _encl, _page) = tracked_page(&pool);
            let inner = pool.cache.inner();
            inner.global_lru.record(id, inner.sections.page(id), PageClass::Reclaimable);

            let (drop_result, isolated) = std::thread::scope(|s| {
                let dropper = s.spawn(|| inner.global_lru.drop_page(id, inner.sections.page(id)));
                let isolator = s.spawn(|| {
                    let mut want = 1;
                    let mut dst = Vec::new();
                    inner.global_lru.isolate(&inner.sections, &mut want, &mut dst);
                    dst
                });
                (dropper.join().unwrap(), isolator.join().unwrap())
            });

            match (&drop_result, isolated.len()) {
                // Isolation won; the drop saw the reclaimer's ownership.
                (Err(Error::Busy), 1) => {
                    inner.global_lru.return_tail(id, inner.sections.page(id));
                    assert!(inner.global_lru.drop_page(id, inner.sections.page(id)).is_ok());
                }
                // Drop won; isolation found nothing.
                (Ok(()), 0) => {}
                other => panic!("both sides completed: {:?}", other.0),
            }
            assert!(!inner.global_lru.contains(id));
        }
    }
}
