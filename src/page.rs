// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-page descriptors. Every EPC page has one, allocated with its section
//! and alive for the lifetime of the section table. The descriptor records
//! where the page is in its lifecycle and, while the page is in use, who
//! owns it.

use std::sync::{Arc, Weak};

use spin::Mutex as SpinMutex;

use epc_pages::PhysAddr;

use crate::cgroup::EpcCgroup;
use crate::encl::{EnclPage, Enclave, VirtOwner};

/// Which LRU list a page is tracked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    Reclaimable,
    Unreclaimable,
}

/// Reclaim tracking for an in-use page.
///
/// `Untracked` is "no reclaim flags": the page is bound to an owner but on
/// no LRU list. `ReclaimInProgress` means the reclaimer has isolated the
/// page onto its private hand-off list; such a page was necessarily
/// reclaimable, so the flag implication holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimState {
    Untracked,
    Unreclaimable,
    Reclaimable,
    ReclaimInProgress,
}

/// Lifecycle state of an EPC page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Not yet scrubbed by the boot sanitizer.
    Unsanitized,
    /// On its section's free list.
    Free,
    /// Bound to an owner.
    InUse(ReclaimState),
}

/// The owner of an in-use page. Exactly one variant applies at a time, so
/// exactly one owner type holds by construction. The cache keeps only weak
/// references; the owning module holds the strong ones, and the reclaimer
/// lifts a temporary strong reference for the duration of a writeback.
#[derive(Clone)]
pub enum PageOwner {
    /// A regular enclave page.
    Enclave(Arc<EnclPage>),
    /// A version-array page, owned by the enclave directly.
    VersionArray(Weak<Enclave>),
    /// A page lent to the virtualization module.
    Virt(Weak<dyn VirtOwner>),
}

impl PageOwner {
    /// Upgrades to the owning enclave, if the owner is enclave-backed and
    /// still alive.
    pub(crate) fn try_get_enclave(&self) -> Option<Arc<Enclave>> {
        match self {
            PageOwner::Enclave(page) => page.enclave(),
            PageOwner::VersionArray(encl) => encl.upgrade(),
            PageOwner::Virt(_) => None,
        }
    }
}

/// Mutable half of a page descriptor. List membership transitions take the
/// owning list's lock before this one.
pub(crate) struct PageMeta {
    pub state: PageState,
    pub owner: Option<PageOwner>,
    pub cgroup: Option<Arc<EpcCgroup>>,
}

/// An EPC page descriptor.
pub(crate) struct EpcPage {
    pa: PhysAddr,
    meta: SpinMutex<PageMeta>,
}

impl EpcPage {
    pub fn new(pa: PhysAddr) -> Self {
        EpcPage {
            pa,
            meta: SpinMutex::new(PageMeta {
                state: PageState::Unsanitized,
                owner: None,
                cgroup: None,
            }),
        }
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.pa
    }

    pub fn meta(&self) -> spin::MutexGuard<'_, PageMeta> {
        self.meta.lock()
    }

    pub fn state(&self) -> PageState {
        self.meta.lock().state
    }
}
