// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Hierarchical charge groups. Each node carries its own LRU scope and a
//! page-count limit; a page charged to a node is tracked on that node's
//! scope instead of the global one. With the feature disabled only an
//! uninhabited stand-in remains, so the rest of the cache keeps a single
//! code path.

#[cfg(feature = "cgroup")]
mod imp {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};

    use crate::lru::{IsolatedPage, LruScope};
    use crate::sched::SchedHooks;
    use crate::{EpcInner, Error, Result, NR_TO_SCAN};

    /// One node of the charge-group tree.
    pub struct EpcCgroup {
        parent: Option<Arc<EpcCgroup>>,
        limit: usize,
        usage: AtomicUsize,
        lru: LruScope,
    }

    impl EpcCgroup {
        pub(crate) fn new(parent: Option<&Arc<EpcCgroup>>, limit: usize) -> Arc<Self> {
            Arc::new(EpcCgroup {
                parent: parent.cloned(),
                limit,
                usage: AtomicUsize::new(0),
                lru: LruScope::new(),
            })
        }

        pub fn usage(&self) -> usize {
            self.usage.load(Ordering::Relaxed)
        }

        pub fn limit(&self) -> usize {
            self.limit
        }

        pub(crate) fn lru(&self) -> &LruScope {
            &self.lru
        }

        /// Whether this scope has anything the reclaimer could take.
        pub fn lru_empty(&self) -> bool {
            self.lru.is_reclaimable_empty()
        }

        /// Charges one page against this node and every ancestor. Either
        /// the whole chain is charged or nothing is.
        fn try_charge_once(&self) -> bool {
            let mut node = Some(self);
            let mut charged: Vec<&EpcCgroup> = Vec::new();
            while let Some(cg) = node {
                if cg.usage.fetch_add(1, Ordering::Relaxed) >= cg.limit {
                    cg.usage.fetch_sub(1, Ordering::Relaxed);
                    for undo in charged {
                        undo.usage.fetch_sub(1, Ordering::Relaxed);
                    }
                    return false;
                }
                charged.push(cg);
                node = cg.parent.as_deref();
            }
            true
        }

        /// Releases one page's charge along the ancestor chain.
        pub(crate) fn uncharge(&self) {
            let mut node = Some(self);
            while let Some(cg) = node {
                let prev = cg.usage.fetch_sub(1, Ordering::Relaxed);
                if prev == 0 {
                    log::warn!("epc: charge group usage underflow");
                    cg.usage.store(0, Ordering::Relaxed);
                }
                node = cg.parent.as_deref();
            }
        }
    }

    impl EpcInner {
        pub(crate) fn register_cgroup(&self, cg: &Arc<EpcCgroup>) {
            let mut registry = self.cgroups.lock();
            registry.retain(|entry| entry.upgrade().is_some());
            registry.push(Arc::downgrade(cg));
        }

        /// Charges `cg` for one page, reclaiming within the scope while the
        /// limit is exceeded and reclaim is allowed.
        pub(crate) fn try_charge(&self, cg: &Arc<EpcCgroup>, may_reclaim: bool) -> Result<()> {
            loop {
                if cg.try_charge_once() {
                    return Ok(());
                }
                if cg.lru_empty() {
                    return Err(Error::OutOfMemory);
                }
                if !may_reclaim {
                    return Err(Error::Busy);
                }
                if self.sched.signal_pending() {
                    return Err(Error::Interrupted);
                }
                self.do_reclaim(NR_TO_SCAN, false, Some(cg));
            }
        }

        /// Whether any charge group still has reclaimable candidates.
        pub(crate) fn cgroups_have_candidates(&self) -> bool {
            let registry = self.cgroups.lock();
            registry
                .iter()
                .filter_map(Weak::upgrade)
                .any(|cg| !cg.lru_empty())
        }

        /// The per-scope half of a global isolation pass: walks registered
        /// groups in order until `want` is satisfied.
        pub(crate) fn isolate_cgroups(&self, want: &mut usize, dst: &mut Vec<IsolatedPage>) {
            let groups: Vec<Arc<EpcCgroup>> = {
                let registry = self.cgroups.lock();
                registry.iter().filter_map(Weak::upgrade).collect()
            };
            for cg in groups {
                if *want == 0 {
                    break;
                }
                cg.lru().isolate(&self.sections, want, dst);
            }
        }
    }
}

#[cfg(feature = "cgroup")]
pub use imp::EpcCgroup;

#[cfg(not(feature = "cgroup"))]
mod stub {
    use crate::lru::LruScope;

    /// Uninhabited stand-in so descriptors can carry an optional group
    /// back-pointer unconditionally.
    pub enum EpcCgroup {}

    impl EpcCgroup {
        pub(crate) fn lru(&self) -> &LruScope {
            match *self {}
        }

        pub(crate) fn uncharge(&self) {
            match *self {}
        }
    }
}

#[cfg(not(feature = "cgroup"))]
pub use stub::EpcCgroup;
