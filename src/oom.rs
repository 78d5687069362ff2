// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Out-of-memory handling. When nothing reclaimable is left, a victim is
//! pulled from an unreclaimable list and its owner is torn down whole,
//! cascading every EPC page the owner held back to the free pool.

use std::sync::Arc;

use crate::cgroup::EpcCgroup;
use crate::encl::{EnclFlags, Enclave, VirtOwner, VmSpace};
use crate::EpcInner;

use epc_pages::PageId;

/// A victim owner whose reference was successfully acquired under the LRU
/// lock.
pub(crate) enum OomVictim {
    Encl(Arc<Enclave>),
    Virt(Arc<dyn VirtOwner>, PageId),
}

/// Tears down the linear mappings an address space holds over `owner`'s
/// range. Matching the mappings to the owner is the address space's
/// concern.
pub fn oom_zap(owner: &Enclave, mm: &dyn VmSpace) {
    mm.zap_range(owner.base(), owner.base() + owner.size());
}

impl EpcInner {
    /// Picks a victim from `scope`'s unreclaimable list and destroys its
    /// owner. Returns whether a victim was found; the teardown itself is
    /// fire-and-forget.
    pub(crate) fn do_oom(&self, scope: Option<&Arc<EpcCgroup>>) -> bool {
        let lru = match scope {
            Some(cg) => cg.lru(),
            None => &self.global_lru,
        };
        let victim = match lru.pick_oom_victim(&self.sections) {
            Some(victim) => victim,
            None => return false,
        };
        match victim {
            OomVictim::Encl(encl) => self.oom_kill_enclave(&encl),
            OomVictim::Virt(owner, id) => {
                owner.oom(id);
            }
        }
        true
    }

    fn oom_kill_enclave(&self, encl: &Arc<Enclave>) {
        // The flag is set under the enclave lock so faults serialized on it
        // cannot install fresh mappings afterwards.
        let prior = encl.set_oom();
        if prior.dead_or_oom() || !prior.contains(EnclFlags::CREATED) {
            return;
        }

        log::info!(
            "epc: out of memory, killing enclave at {:?} ({} pages)",
            encl.base(),
            encl.size() / epc_pages::PAGE_SIZE
        );

        let start = encl.base();
        let end = encl.base() + encl.size();
        encl.mm_list().walk_stable(|mm| mm.zap_range(start, end));

        encl.destroy_with(self);
    }
}
