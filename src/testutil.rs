// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Shared test fixtures: mock hardware with scriptable results, a mock
//! backing store, mock address spaces, and enclave builders wired to a
//! fully constructed cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spin::Mutex as SpinMutex;

use epc_pages::{CpuSet, EpcAddr, PageId, PhysAddr, VirtAddr, PAGE_SIZE};

use crate::encl::{Backing, BackingStore, Enclave, EnclPage, VaPage, VmSpace};
use crate::hw::{EpcHw, HwError, HwResult, IpiOps, PageInfo};
use crate::page::{PageClass, PageOwner};
use crate::sched::SchedHooks;
use crate::section::SectionConfig;
use crate::{EpcCache, EpcParams, Error, Result};

#[cfg(feature = "cgroup")]
use crate::cgroup::EpcCgroup;

const ENCL_BASE: u64 = 0x2_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HwOp {
    Remove(usize),
    Block(usize),
    Track(usize),
    Writeback(usize),
}

/// Mock hardware primitives. Results default to success; failures are
/// scripted per address and consumed in order.
pub(crate) struct MockHw {
    ops: SpinMutex<Vec<HwOp>>,
    remove_script: SpinMutex<HashMap<usize, VecDeque<HwError>>>,
    writeback_script: SpinMutex<HashMap<usize, VecDeque<HwError>>>,
}

impl MockHw {
    pub fn new() -> Arc<Self> {
        Arc::new(MockHw {
            ops: SpinMutex::new(Vec::new()),
            remove_script: SpinMutex::new(HashMap::new()),
            writeback_script: SpinMutex::new(HashMap::new()),
        })
    }

    pub fn script_remove(&self, addr: EpcAddr, errors: &[HwError]) {
        self.remove_script
            .lock()
            .entry(addr.bits())
            .or_default()
            .extend(errors.iter().copied());
    }

    pub fn script_writeback(&self, addr: EpcAddr, errors: &[HwError]) {
        self.writeback_script
            .lock()
            .entry(addr.bits())
            .or_default()
            .extend(errors.iter().copied());
    }

    pub fn ops(&self) -> Vec<HwOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn count(&self, matches: impl Fn(&HwOp) -> bool) -> usize {
        self.ops.lock().iter().filter(|op| matches(*op)).count()
    }

    fn scripted(map: &SpinMutex<HashMap<usize, VecDeque<HwError>>>, addr: usize) -> HwResult {
        if let Some(queue) = map.lock().get_mut(&addr) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl EpcHw for MockHw {
    fn remove(&self, page: EpcAddr) -> HwResult {
        self.ops.lock().push(HwOp::Remove(page.bits()));
        Self::scripted(&self.remove_script, page.bits())
    }

    fn block(&self, page: EpcAddr) -> HwResult {
        self.ops.lock().push(HwOp::Block(page.bits()));
        Ok(())
    }

    fn track(&self, secs: EpcAddr) -> HwResult {
        self.ops.lock().push(HwOp::Track(secs.bits()));
        Ok(())
    }

    fn writeback(&self, _info: &PageInfo, page: EpcAddr, _va_slot: EpcAddr) -> HwResult {
        self.ops.lock().push(HwOp::Writeback(page.bits()));
        Self::scripted(&self.writeback_script, page.bits())
    }
}

pub(crate) struct MockIpi {
    masks: SpinMutex<Vec<CpuSet>>,
}

impl MockIpi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockIpi {
            masks: SpinMutex::new(Vec::new()),
        })
    }

    pub fn masks(&self) -> Vec<CpuSet> {
        self.masks.lock().clone()
    }
}

impl IpiOps for MockIpi {
    fn ipi_on(&self, cpus: &CpuSet) {
        self.masks.lock().push(*cpus);
    }
}

pub(crate) struct MockSched {
    pending: AtomicBool,
}

impl MockSched {
    pub fn new() -> Arc<Self> {
        Arc::new(MockSched {
            pending: AtomicBool::new(false),
        })
    }

    pub fn set_pending(&self, pending: bool) {
        self.pending.store(pending, Ordering::Relaxed);
    }
}

impl SchedHooks for MockSched {
    fn signal_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Backing store over synthetic host addresses, with per-index failure
/// injection and a log of releases.
pub(crate) struct MockBacking {
    failing: SpinMutex<HashSet<usize>>,
    puts: SpinMutex<Vec<(usize, bool)>>,
}

impl MockBacking {
    pub fn new() -> Arc<Self> {
        Arc::new(MockBacking {
            failing: SpinMutex::new(HashSet::new()),
            puts: SpinMutex::new(Vec::new()),
        })
    }

    pub fn fail_index(&self, index: usize) {
        self.failing.lock().insert(index);
    }

    pub fn puts(&self) -> Vec<(usize, bool)> {
        self.puts.lock().clone()
    }
}

impl BackingStore for MockBacking {
    fn get_backing(&self, index: usize) -> Result<Backing> {
        if self.failing.lock().contains(&index) {
            return Err(Error::OutOfMemory);
        }
        Ok(Backing {
            contents: (0x5000_0000 + index * PAGE_SIZE) as u64,
            metadata: (0x6000_0000 + index * 64) as u64,
            token: index,
        })
    }

    fn put_backing(&self, backing: Backing, dirty: bool) {
        self.puts.lock().push((backing.token, dirty));
    }
}

/// One mock address space: a set of recently-accessed pages, a zap log,
/// and a CPU mask.
pub(crate) struct MockMm {
    young: SpinMutex<HashSet<u64>>,
    zaps: SpinMutex<Vec<(VirtAddr, VirtAddr)>>,
    cpus: SpinMutex<CpuSet>,
}

impl MockMm {
    pub fn new() -> Self {
        MockMm {
            young: SpinMutex::new(HashSet::new()),
            zaps: SpinMutex::new(Vec::new()),
            cpus: SpinMutex::new(CpuSet::new()),
        }
    }

    pub fn set_young(&self, addr: VirtAddr) {
        self.young.lock().insert(addr.bits());
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpus.lock().set(cpu);
    }

    pub fn zaps(&self) -> Vec<(VirtAddr, VirtAddr)> {
        self.zaps.lock().clone()
    }
}

impl VmSpace for MockMm {
    fn test_and_clear_young(&self, addr: VirtAddr) -> bool {
        self.young.lock().remove(&addr.bits())
    }

    fn zap_range(&self, start: VirtAddr, end: VirtAddr) {
        self.zaps.lock().push((start, end));
    }

    fn cpu_mask(&self) -> CpuSet {
        *self.cpus.lock()
    }
}

pub(crate) fn section_configs(sizes: &[usize]) -> Vec<SectionConfig> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, &nr_pages)| SectionConfig {
            base: PhysAddr::new(0x1000_0000 + (i as u64) * 0x100_0000),
            size: nr_pages * PAGE_SIZE,
            host_base: 0x7000_0000_0000 + i * 0x100_0000,
        })
        .collect()
}

pub(crate) fn host_addr(config: &SectionConfig, index: usize) -> EpcAddr {
    EpcAddr::new(config.host_base) + index * PAGE_SIZE
}

/// An enclave with a mock backing store and no flags set. Enough for
/// owner-liveness tests; `TestPool::test_encl` builds fully wired ones.
pub(crate) fn bare_enclave(nr_pages: usize) -> Arc<Enclave> {
    Enclave::new(
        VirtAddr::new(ENCL_BASE),
        nr_pages * PAGE_SIZE,
        MockBacking::new(),
    )
}

pub(crate) fn va_owner(encl: &Arc<Enclave>) -> PageOwner {
    PageOwner::VersionArray(Arc::downgrade(encl))
}

pub(crate) struct TestPool {
    pub cache: EpcCache,
    pub hw: Arc<MockHw>,
    pub ipi: Arc<MockIpi>,
    pub sched: Arc<MockSched>,
}

pub(crate) struct TestEncl {
    pub encl: Arc<Enclave>,
    pub mm: Arc<MockMm>,
    pub backing: Arc<MockBacking>,
}

/// A sanitized pool with watermarks disabled, so nothing reclaims in the
/// background unless a test asks for it.
pub(crate) fn pool(sizes: &[usize]) -> TestPool {
    pool_with_hw(
        sizes,
        EpcParams {
            nr_low_pages: 0,
            nr_high_pages: 0,
        },
        MockHw::new(),
    )
}

pub(crate) fn pool_with_hw(sizes: &[usize], params: EpcParams, hw: Arc<MockHw>) -> TestPool {
    let ipi = MockIpi::new();
    let sched = MockSched::new();
    let cache = EpcCache::new(
        params,
        &section_configs(sizes),
        hw.clone(),
        ipi.clone(),
        sched.clone(),
    )
    .unwrap();
    assert!(cache.wait_until_sanitized(Duration::from_secs(5)));
    TestPool {
        cache,
        hw,
        ipi,
        sched,
    }
}

impl TestPool {
    /// A created, initialized enclave with one address space attached.
    pub fn enclave(&self, nr_pages: usize) -> Arc<Enclave> {
        self.test_encl_bare(nr_pages).encl
    }

    fn test_encl_bare(&self, nr_pages: usize) -> TestEncl {
        let backing = MockBacking::new();
        let encl = Enclave::new(VirtAddr::new(ENCL_BASE), nr_pages * PAGE_SIZE, backing.clone());
        encl.mark_created();
        encl.mark_initialized();
        let mm = Arc::new(MockMm::new());
        let dyn_mm: Arc<dyn VmSpace> = mm.clone();
        encl.add_mm(&dyn_mm);
        TestEncl { encl, mm, backing }
    }

    /// A fully wired enclave: secrets page and one version-array page
    /// allocated and tracked on the unreclaimable list.
    pub fn test_encl(&self, nr_pages: usize) -> TestEncl {
        let fixture = self.test_encl_bare(nr_pages);
        let secs = fixture.encl.create_secs();
        let secs_id = self
            .cache
            .alloc_page(PageOwner::Enclave(secs.clone()), false)
            .unwrap();
        secs.set_epc(secs_id);
        self.cache.record_page(secs_id, PageClass::Unreclaimable);
        self.attach_va_page(&fixture.encl);
        fixture
    }

    /// Allocates the enclave's `index`-th page from the pool.
    pub fn attach_page(&self, encl: &Arc<Enclave>, index: usize) -> (PageId, Arc<EnclPage>) {
        let page = encl.add_page(encl.base() + index * PAGE_SIZE);
        let id = self
            .cache
            .alloc_page(PageOwner::Enclave(page.clone()), false)
            .unwrap();
        page.set_epc(id);
        (id, page)
    }

    #[cfg(feature = "cgroup")]
    pub fn attach_page_charged(
        &self,
        encl: &Arc<Enclave>,
        index: usize,
        cg: &Arc<EpcCgroup>,
    ) -> (PageId, Arc<EnclPage>) {
        let page = encl.add_page(encl.base() + index * PAGE_SIZE);
        let id = self
            .cache
            .alloc_page_charged(PageOwner::Enclave(page.clone()), false, cg)
            .unwrap();
        page.set_epc(id);
        (id, page)
    }

    /// Allocates a version-array page for `encl` and tracks it.
    pub fn attach_va_page(&self, encl: &Arc<Enclave>) -> PageId {
        let id = self.cache.alloc_page(va_owner(encl), false).unwrap();
        encl.add_va_page(VaPage::new(id));
        self.cache.record_page(id, PageClass::Unreclaimable);
        id
    }
}
