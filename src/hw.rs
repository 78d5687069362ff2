// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! The seam to the privileged EPC hardware primitives. The cache names the
//! operations by role; the embedder binds them to the actual instructions.

use epc_pages::{CpuSet, EpcAddr};

/// Page information block handed to the writeback primitive: where the
/// encrypted contents and the integrity metadata land in backing storage.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub addr: u64,
    pub secs: u64,
    pub contents: u64,
    pub metadata: u64,
}

/// Status codes a hardware primitive can fail with. `NotTracked` is the
/// distinguished writeback result driving the track/kick escalation;
/// `ChildPresent` is how removal reports a parent page whose children still
/// exist. Everything else is carried opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwError {
    NotTracked,
    ChildPresent,
    Op(u32),
}

pub type HwResult = core::result::Result<(), HwError>;

/// Privileged EPC page primitives.
///
/// All operations take addresses in the host-mapped EPC view. `writeback`
/// encrypts the page out to the backing locations in `info` and retires the
/// version-array slot at `va_slot`; `track` opens a new tracking epoch on
/// the enclave whose top-level secrets page is `secs`.
pub trait EpcHw: Send + Sync {
    fn remove(&self, page: EpcAddr) -> HwResult;
    fn block(&self, page: EpcAddr) -> HwResult;
    fn track(&self, secs: EpcAddr) -> HwResult;
    fn writeback(&self, info: &PageInfo, page: EpcAddr, va_slot: EpcAddr) -> HwResult;
}

/// Per-CPU broadcast: deliver a no-op interrupt to every CPU in `cpus`,
/// forcing them to briefly leave any enclave they are executing in.
pub trait IpiOps: Send + Sync {
    fn ipi_on(&self, cpus: &CpuSet);
}
