//! Virtual address spaces and VMO mappings
//!
//! A VAS is a page-table root plus an ordered set of VMO mappings. The
//! upper half of every VAS aliases the kernel's tables; the lower half is
//! private. Mapping records are shared objects with a region lock the
//! syscall layer uses to pin user-pointer ranges for the duration of a
//! call.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use spin::Mutex;

use crate::sync::SharedLock;

use super::page_table::{self, MapFlags};
use super::vdso;
use super::vmo::{Vmo, VmoKind};
use super::{PhysAddr, VirtAddr};

/// A live association between a virtual range and a VMO within one VAS.
///
/// The record stays referenced after an unmap; it answers "invalid" to
/// later lock attempts instead of disappearing.
pub struct Mapping {
    start: VirtAddr,
    end: VirtAddr,
    flags: MapFlags,
    valid: AtomicBool,
    region_lock: SharedLock,
    vmo: Mutex<Option<Arc<Vmo>>>,
    vas: Mutex<Option<Weak<Vas>>>,
}

impl Mapping {
    fn new(vas: Weak<Vas>, start: VirtAddr, end: VirtAddr, vmo: Arc<Vmo>, flags: MapFlags) -> Arc<Self> {
        Arc::new(Self {
            start,
            end,
            flags,
            valid: AtomicBool::new(true),
            region_lock: SharedLock::new(),
            vmo: Mutex::new(Some(vmo)),
            vas: Mutex::new(Some(vas)),
        })
    }

    /// Half-open virtual range this mapping covers (covered, for an
    /// invalidated record).
    pub fn range(&self) -> (VirtAddr, VirtAddr) {
        (self.start, self.end)
    }

    pub fn has_flags(&self, flags: MapFlags) -> bool {
        self.flags.contains(flags)
    }

    /// Whether the mapping has been torn down.
    pub fn is_invalid(&self) -> bool {
        !self.valid.load(Ordering::Acquire)
    }

    /// The owning address space, while the mapping is live.
    pub fn vas(&self) -> Option<Arc<Vas>> {
        self.vas.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Called under the exclusive region hold during unmap.
    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        *self.vmo.lock() = None;
        *self.vas.lock() = None;
    }
}

/// Shared hold on the mapping containing a borrowed user region.
///
/// Keeps the mapping pinned (no concurrent unmap can invalidate it) until
/// dropped; syscall glue keeps one alive for each validated pointer
/// argument.
pub struct RegionGuard {
    mapping: Arc<Mapping>,
}

impl RegionGuard {
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        self.mapping.region_lock.release_shared();
    }
}

struct VasInner {
    claimed: bool,
    mappings: BTreeMap<u64, Arc<Mapping>>,
    vdso_mapping: Option<Arc<Mapping>>,
}

/// A virtual address space: a page-table root and its mapping set.
pub struct Vas {
    asid: PhysAddr,
    owns_root: bool,
    self_ref: Weak<Vas>,
    inner: Mutex<VasInner>,
}

/// vDSO mapping base: a fixed displacement below the canonical top of
/// user space. Entropy here is an extension point.
fn vdso_mapping_base(vdso_length: usize) -> VirtAddr {
    VirtAddr::new(0x8000_0000_0000 - 2 * vdso_length as u64)
}

impl Vas {
    /// Create a fresh address space whose upper half aliases the
    /// kernel's. With `map_vdso`, the vDSO object is mapped at its
    /// canonical high base and remembered for [`Vas::vdso_base`].
    pub fn create(map_vdso: bool) -> Arc<Self> {
        let vas = Arc::new_cyclic(|self_ref| Self {
            asid: page_table::clone_upper_half(),
            owns_root: true,
            self_ref: self_ref.clone(),
            inner: Mutex::new(VasInner {
                claimed: false,
                mappings: BTreeMap::new(),
                vdso_mapping: None,
            }),
        });

        if map_vdso {
            let vdso = vdso::get();
            let base = vdso_mapping_base(vdso.length());
            vas.map_vmo(vdso, base, MapFlags::USER | MapFlags::READ_ONLY);
        }

        vas
    }

    /// Wrap an already-live page-table root (the boot address space).
    /// The root is not torn down when the VAS drops.
    pub fn adopt_existing_asid(asid: PhysAddr) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            asid,
            owns_root: false,
            self_ref: self_ref.clone(),
            inner: Mutex::new(VasInner {
                claimed: false,
                mappings: BTreeMap::new(),
                vdso_mapping: None,
            }),
        })
    }

    /// Physical address of this space's page-table root.
    pub fn asid(&self) -> PhysAddr {
        self.asid
    }

    /// Claim this VAS for a process. At most one claim ever succeeds.
    pub fn claim_for_process(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.claimed {
            return false;
        }
        inner.claimed = true;
        true
    }

    /// Where the vDSO is mapped, if it was mapped at creation.
    pub fn vdso_base(&self) -> Option<VirtAddr> {
        self.inner
            .lock()
            .vdso_mapping
            .as_ref()
            .map(|mapping| mapping.range().0)
    }

    /// Map a VMO at `base`.
    ///
    /// `base` must be aligned to the VMO's page size, and the new range
    /// must not overlap any live mapping; either violation is fatal. A
    /// sparse VMO must be fully committed (on-demand faulting is an
    /// extension point).
    pub fn map_vmo(&self, vmo: Arc<Vmo>, base: VirtAddr, flags: MapFlags) -> Arc<Mapping> {
        let mut inner = self.inner.lock();

        let page_size = vmo.page_size();
        if !base.is_aligned(page_size) {
            panic!(
                "tried to map a VMO with page size {} at an unaligned base {}",
                page_size, base
            );
        }

        let end = base.offset(vmo.length() as u64);

        // Two half-open ranges are "equal" iff they overlap; the nearest
        // mapping starting below our end is the only overlap candidate.
        if let Some((_, neighbour)) = inner.mappings.range(..end.value()).next_back() {
            let (n_start, n_end) = neighbour.range();
            if n_end.value() > base.value() {
                panic!(
                    "tried to map a VMO at ({}, {}), which is already occupied by ({}, {})",
                    base, end, n_start, n_end
                );
            }
        }

        let mapping = Mapping::new(self.self_ref.clone(), base, end, vmo.clone(), flags);
        inner.mappings.insert(base.value(), mapping.clone());

        match vmo.kind() {
            VmoKind::Physical { .. } => {
                page_table::map_physical(self.asid, base, end, vmo.base(), flags);
            }
            VmoKind::Sparse { .. } => {
                if !vmo.is_fully_committed() {
                    panic!("mapping uncommitted sparse VMOs is not supported yet");
                }
                vmo.for_each_committed(|offset, frame| {
                    let page_base = base.offset(offset as u64);
                    page_table::map_physical(
                        self.asid,
                        page_base,
                        page_base.offset(page_size as u64),
                        frame,
                        flags,
                    );
                });
            }
        }

        if inner.vdso_mapping.is_none() {
            if let Some(registered) = vdso::try_get() {
                if Arc::ptr_eq(&vmo, &registered) {
                    inner.vdso_mapping = Some(mapping.clone());
                }
            }
        }

        mapping
    }

    /// Tear down a mapping: remove its page-table entries and invalidate
    /// the record. Holders of the record observe [`Mapping::is_invalid`].
    pub fn unmap(&self, mapping: &Arc<Mapping>) {
        mapping.region_lock.acquire_exclusive();

        {
            let mut inner = self.inner.lock();
            let (start, end) = mapping.range();
            inner.mappings.remove(&start.value());
            page_table::unmap(self.asid, start, end, false);
            mapping.invalidate();
        }

        mapping.region_lock.release_exclusive();
    }

    /// Borrow the mapping containing `[start, end)` with a shared hold.
    ///
    /// Fails when the range is not fully inside one live mapping, or when
    /// `writable` access is requested against a read-only mapping.
    pub fn lock_address_range(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        writable: bool,
    ) -> Option<RegionGuard> {
        let mapping = {
            let inner = self.inner.lock();
            let (_, candidate) = inner.mappings.range(..=start.value()).next_back()?;
            let (m_start, m_end) = candidate.range();
            if m_start.value() > start.value() || m_end.value() < end.value() {
                return None;
            }
            if writable && candidate.has_flags(MapFlags::READ_ONLY) {
                return None;
            }
            candidate.clone()
        };

        // The shared hold is taken outside the VAS lock so a concurrent
        // unmap (which holds the exclusive side while waiting for the VAS
        // lock) cannot deadlock against us; revalidate afterwards.
        mapping.region_lock.acquire_shared();
        if mapping.is_invalid() {
            mapping.region_lock.release_shared();
            return None;
        }

        Some(RegionGuard { mapping })
    }
}

impl Drop for Vas {
    fn drop(&mut self) {
        if self.owns_root {
            // Mappings are gone with the inner state; only the private
            // half's table frames and the root remain to release.
            page_table::destroy_root(self.asid);
        }
    }
}
