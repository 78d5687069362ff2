// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The EPC-facing half of an enclave, shared with the external enclave
//! lifecycle module, plus the collaborator traits the cache consumes: the
//! per-enclave backing store, the address spaces mapping an enclave, and
//! the virtualization owner.
//!
//! The enclave module holds the strong references to its pages; the cache
//! tracks pages through weak back-links and lifts a temporary strong
//! reference only for the duration of a reclaim pass.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use epc_pages::{CpuSet, PageId, VirtAddr, PAGE_SIZE};

use crate::{Error, Result};

/// Number of version-array slots in one EPC page (one u64 counter each).
pub const VA_SLOT_COUNT: usize = PAGE_SIZE / 8;

bitflags! {
    /// Enclave lifecycle flags. `DEAD` and `OOM` both stop reclaim from
    /// treating the enclave as live; `CREATED` gates the OOM kill path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnclFlags: u32 {
        const CREATED = 1 << 0;
        const INITIALIZED = 1 << 1;
        const DEAD = 1 << 2;
        const OOM = 1 << 3;
    }
}

impl EnclFlags {
    pub fn dead_or_oom(&self) -> bool {
        self.intersects(EnclFlags::DEAD | EnclFlags::OOM)
    }
}

/// Backing storage for one evicted page: host addresses of the buffers the
/// writeback primitive encrypts the contents and integrity metadata into,
/// plus an opaque token for the provider's own bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Backing {
    pub contents: u64,
    pub metadata: u64,
    pub token: usize,
}

/// Per-enclave backing storage provider, indexed by page number within the
/// enclave's range (the top-level secrets page uses `size / PAGE_SIZE`).
pub trait BackingStore: Send + Sync {
    fn get_backing(&self, index: usize) -> Result<Backing>;
    fn put_backing(&self, backing: Backing, dirty: bool);
}

/// One address space mapping an enclave. The implementation is expected to
/// confine `zap_range` to the mappings actually belonging to the enclave.
pub trait VmSpace: Send + Sync {
    /// Read and clear the accessed bit for the mapping of `addr`.
    fn test_and_clear_young(&self, addr: VirtAddr) -> bool;
    /// Tear down the linear mappings covering `[start, end)`.
    fn zap_range(&self, start: VirtAddr, end: VirtAddr);
    /// CPUs that may currently be executing in this address space.
    fn cpu_mask(&self) -> CpuSet;
}

/// Owner of an EPC page lent to the virtualization module. Out-of-memory
/// handling of such pages is delegated wholesale.
pub trait VirtOwner: Send + Sync {
    fn oom(&self, page: PageId) -> bool;
}

/// The set of address spaces currently mapping an enclave.
///
/// Readers never block additions: a walk snapshots the list under a
/// sleepable read lock and re-runs whenever the monotonic version counter
/// advanced during the walk, so a mapping added concurrently is always
/// observed by one full pass.
pub struct MmList {
    version: AtomicU64,
    entries: RwLock<Vec<Weak<dyn VmSpace>>>,
}

impl MmList {
    fn new() -> Self {
        MmList {
            version: AtomicU64::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, mm: &Arc<dyn VmSpace>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.upgrade().is_some());
        entries.push(Arc::downgrade(mm));
        // Publish after the entry is visible so a walker that misses it
        // also sees the version advance and retries.
        self.version.fetch_add(1, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<Arc<dyn VmSpace>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// One pass over the current mappings. `f` returns `false` to stop
    /// early. Additions racing the walk may be missed.
    pub fn for_each<F: FnMut(&Arc<dyn VmSpace>) -> bool>(&self, mut f: F) {
        for mm in self.snapshot() {
            if !f(&mm) {
                break;
            }
        }
    }

    /// A full pass over the mappings, re-run until no mapping was added
    /// while the walk was in flight.
    pub fn walk_stable<F: FnMut(&Arc<dyn VmSpace>)>(&self, mut f: F) {
        loop {
            let version = self.version.load(Ordering::Acquire);
            for mm in self.snapshot() {
                f(&mm);
            }
            if self.version.load(Ordering::Acquire) == version {
                break;
            }
        }
    }
}

struct VaSlots {
    bitmap: [u64; VA_SLOT_COUNT / 64],
    used: usize,
}

/// A version-array page: an EPC page holding `VA_SLOT_COUNT` integrity
/// counter slots, handed out one per evicted page.
pub struct VaPage {
    epc: PageId,
    slots: SpinMutex<VaSlots>,
}

impl VaPage {
    pub fn new(epc: PageId) -> Arc<Self> {
        Arc::new(VaPage {
            epc,
            slots: SpinMutex::new(VaSlots {
                bitmap: [0; VA_SLOT_COUNT / 64],
                used: 0,
            }),
        })
    }

    pub fn epc(&self) -> PageId {
        self.epc
    }

    /// Claims a free slot, or `None` if the page is exhausted.
    pub fn alloc_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        let word = slots.bitmap.iter().position(|word| *word != u64::MAX)?;
        let bit = slots.bitmap[word].trailing_ones() as usize;
        slots.bitmap[word] |= 1 << bit;
        slots.used += 1;
        Some(word * 64 + bit)
    }

    pub fn free_slot(&self, slot: usize) {
        let mut slots = self.slots.lock();
        let (word, bit) = (slot / 64, slot % 64);
        if slots.bitmap[word] & (1 << bit) != 0 {
            slots.bitmap[word] &= !(1 << bit);
            slots.used -= 1;
        }
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().used == VA_SLOT_COUNT
    }
}

/// A claimed version-array slot: the page it lives on and the slot index.
#[derive(Clone)]
pub struct VaSlot {
    pub va_page: Arc<VaPage>,
    pub slot: usize,
}

#[derive(Default)]
struct EnclPageState {
    /// Set while an eviction is in flight so concurrent faults see it.
    reclaimed: bool,
    epc: Option<PageId>,
    va: Option<VaSlot>,
}

/// One page of an enclave's address range. Holds the weak link back to its
/// enclave; the enclave's page registry holds the strong reference.
pub struct EnclPage {
    encl: Weak<Enclave>,
    addr: VirtAddr,
    state: SpinMutex<EnclPageState>,
}

impl EnclPage {
    pub fn enclave(&self) -> Option<Arc<Enclave>> {
        self.encl.upgrade()
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    /// Index of this page in the enclave's backing store.
    pub fn backing_index(&self, encl: &Enclave) -> usize {
        // Unwrap okay: pages are only created inside their enclave's range.
        self.addr.page_index_from(encl.base()).unwrap()
    }

    pub fn epc(&self) -> Option<PageId> {
        self.state.lock().epc
    }

    pub fn set_epc(&self, id: PageId) {
        self.state.lock().epc = Some(id);
    }

    pub fn take_epc(&self) -> Option<PageId> {
        self.state.lock().epc.take()
    }

    pub fn is_reclaimed(&self) -> bool {
        self.state.lock().reclaimed
    }

    pub(crate) fn set_reclaimed(&self, reclaimed: bool) {
        self.state.lock().reclaimed = reclaimed;
    }

    pub fn va_slot(&self) -> Option<VaSlot> {
        self.state.lock().va.clone()
    }

    pub(crate) fn set_va_slot(&self, va: VaSlot) {
        self.state.lock().va = Some(va);
    }
}

/// Fields of the enclave mutated during writeback, guarded by the sleepable
/// enclave lock.
pub(crate) struct EnclInner {
    pub secs: Option<Arc<EnclPage>>,
    pub child_cnt: usize,
    /// Version-array pages, first page never full: a page filling up is
    /// rotated to the back.
    pub va_pages: VecDeque<Arc<VaPage>>,
    pub pages: Vec<Arc<EnclPage>>,
}

/// The EPC-facing state of one enclave.
pub struct Enclave {
    base: VirtAddr,
    size: usize,
    flags: AtomicU32,
    mm_list: MmList,
    backing: Arc<dyn BackingStore>,
    inner: Mutex<EnclInner>,
}

impl Enclave {
    pub fn new(base: VirtAddr, size: usize, backing: Arc<dyn BackingStore>) -> Arc<Self> {
        Arc::new(Enclave {
            base,
            size,
            flags: AtomicU32::new(0),
            mm_list: MmList::new(),
            backing,
            inner: Mutex::new(EnclInner {
                secs: None,
                child_cnt: 0,
                va_pages: VecDeque::new(),
                pages: Vec::new(),
            }),
        })
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> EnclFlags {
        EnclFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn mark_created(&self) {
        self.flags
            .fetch_or(EnclFlags::CREATED.bits(), Ordering::Relaxed);
    }

    pub fn mark_initialized(&self) {
        self.flags
            .fetch_or(EnclFlags::INITIALIZED.bits(), Ordering::Relaxed);
    }

    pub fn mark_dead(&self) {
        self.flags
            .fetch_or(EnclFlags::DEAD.bits(), Ordering::Relaxed);
    }

    /// Sets the OOM flag under the enclave lock, so page faults serialized
    /// on the lock cannot install new mappings afterwards. Returns the
    /// flags as they were before.
    pub(crate) fn set_oom(&self) -> EnclFlags {
        let _inner = self.lock();
        EnclFlags::from_bits_truncate(
            self.flags.fetch_or(EnclFlags::OOM.bits(), Ordering::Relaxed),
        )
    }

    pub fn mm_list(&self) -> &MmList {
        &self.mm_list
    }

    pub fn add_mm(&self, mm: &Arc<dyn VmSpace>) {
        self.mm_list.add(mm);
    }

    pub fn backing(&self) -> &dyn BackingStore {
        &*self.backing
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EnclInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Union of the CPU masks of every address space mapping the enclave.
    pub fn cpu_mask(&self) -> CpuSet {
        let mut mask = CpuSet::new();
        self.mm_list.for_each(|mm| {
            mask.union_with(&mm.cpu_mask());
            true
        });
        mask
    }

    /// Registers a regular page at `addr`. The caller allocates the EPC
    /// page and records it with the cache separately.
    pub fn add_page(self: &Arc<Self>, addr: VirtAddr) -> Arc<EnclPage> {
        let page = Arc::new(EnclPage {
            encl: Arc::downgrade(self),
            addr,
            state: SpinMutex::new(EnclPageState::default()),
        });
        let mut inner = self.lock();
        inner.pages.push(page.clone());
        inner.child_cnt += 1;
        page
    }

    /// Creates the top-level secrets page record. Its backing index is the
    /// page just past the enclave's range.
    pub fn create_secs(self: &Arc<Self>) -> Arc<EnclPage> {
        let page = Arc::new(EnclPage {
            encl: Arc::downgrade(self),
            addr: self.base + self.size,
            state: SpinMutex::new(EnclPageState::default()),
        });
        self.lock().secs = Some(page.clone());
        page
    }

    pub fn secs_page(&self) -> Option<Arc<EnclPage>> {
        self.lock().secs.clone()
    }

    pub fn add_va_page(&self, va: Arc<VaPage>) {
        self.lock().va_pages.push_back(va);
    }

    pub fn child_count(&self) -> usize {
        self.lock().child_cnt
    }

    /// Tears the enclave down: marks it dead and returns every EPC page it
    /// still holds to the cache. Pages currently owned by the reclaimer are
    /// skipped; the reclaimer frees them when its pass completes.
    pub fn destroy(&self, cache: &crate::EpcCache) {
        self.destroy_with(cache.inner());
    }

    pub(crate) fn destroy_with(&self, epc: &crate::EpcInner) {
        self.mark_dead();

        let (pages, va_pages, secs) = {
            let mut inner = self.lock();
            inner.child_cnt = 0;
            (
                std::mem::take(&mut inner.pages),
                std::mem::take(&mut inner.va_pages),
                inner.secs.take(),
            )
        };

        for page in pages {
            if let Some(id) = page.take_epc() {
                if epc.drop_page(id).is_ok() {
                    epc.free_page(id);
                }
            }
        }
        for va in va_pages {
            let id = va.epc();
            if epc.drop_page(id).is_ok() {
                epc.free_page(id);
            }
        }
        if let Some(secs) = secs {
            if let Some(id) = secs.take_epc() {
                if epc.drop_page(id).is_ok() {
                    epc.free_page(id);
                }
            }
        }
    }
}

/// Allocates a version-array slot from the enclave's first non-full
/// version page, rotating a page that just filled up to the back of the
/// ring. Fails with `OutOfMemory` when every slot is taken.
pub(crate) fn alloc_va_slot(inner: &mut EnclInner) -> Result<VaSlot> {
    let va_page = inner.va_pages.front().cloned().ok_or(Error::OutOfMemory)?;
    let slot = va_page.alloc_slot().ok_or(Error::OutOfMemory)?;
    if va_page.is_full() {
        inner.va_pages.rotate_left(1);
    }
    Ok(VaSlot { va_page, slot })
}
