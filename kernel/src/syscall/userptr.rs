//! User-pointer validation
//!
//! Pointer arguments are validated (alignment, containment in a live
//! mapping, writability) and then pinned: the returned [`UserPtr`] keeps
//! a shared hold on the containing mapping for as long as the syscall
//! uses it. Payloads are copied through kernel-side shadows; handlers
//! write results back on success only.

use core::marker::PhantomData;

use crate::mm::vas::RegionGuard;
use crate::mm::VirtAddr;
use crate::process::Process;

use super::abi::SysResult;

/// A validated, pinned user pointer.
pub struct UserPtr<T> {
    _region: RegionGuard,
    ptr: *mut T,
    _marker: PhantomData<T>,
}

impl<T: Copy> UserPtr<T> {
    /// Copy the pointee into a kernel shadow.
    pub fn read(&self) -> T {
        // SAFETY: validation pinned the containing mapping for the
        // guard's lifetime and checked alignment and containment.
        unsafe { self.ptr.read_volatile() }
    }

    /// Copy a kernel shadow back out to userspace.
    pub fn write(&self, value: T) {
        // SAFETY: as in `read`; the mapping was validated writable.
        unsafe { self.ptr.write_volatile(value) };
    }
}

/// Validate `addr` as a `T`-typed pointer of the calling process.
pub fn validate<T>(process: &Process, addr: u64, writable: bool) -> Result<UserPtr<T>, SysResult> {
    if addr == 0 || addr % core::mem::align_of::<T>() as u64 != 0 {
        return Err(SysResult::InvalidPointers);
    }

    let end = addr
        .checked_add(core::mem::size_of::<T>() as u64)
        .ok_or(SysResult::InvalidPointers)?;

    let region = process
        .vas()
        .lock_address_range(VirtAddr::new(addr), VirtAddr::new(end), writable)
        .ok_or(SysResult::InvalidPointers)?;

    Ok(UserPtr {
        _region: region,
        ptr: addr as *mut T,
        _marker: PhantomData,
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::page_table::MapFlags;
    use crate::mm::vas::Vas;
    use crate::mm::vmo::Vmo;
    use crate::mm::PAGE_SIZES;
    use crate::test_support;

    /// A process whose VAS maps one arena page at its own (identity)
    /// address, so validated pointers are real host memory.
    fn process_with_identity_page() -> (alloc::sync::Arc<Process>, u64) {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();

        let page = test_support::alloc_arena(PAGE_SIZES[0], PAGE_SIZES[0]);
        let vas = Vas::create(false);
        vas.map_vmo(
            Vmo::create_physical(page, PAGE_SIZES[0], 0),
            VirtAddr::new(page.value()),
            MapFlags::USER,
        );

        let process = Process::create(vas).expect("fresh VAS should be claimable");
        (process, page.value())
    }

    #[test]
    fn validated_pointers_read_and_write_through() {
        let (process, base) = process_with_identity_page();

        let ptr = validate::<u64>(&process, base + 0x10, true).expect("mapped pointer");
        ptr.write(0xdead_beef);
        assert_eq!(ptr.read(), 0xdead_beef);
    }

    #[test]
    fn bad_pointers_are_rejected() {
        let (process, base) = process_with_identity_page();

        // Null.
        assert!(matches!(
            validate::<u64>(&process, 0, false),
            Err(SysResult::InvalidPointers)
        ));
        // Misaligned.
        assert!(matches!(
            validate::<u64>(&process, base + 3, false),
            Err(SysResult::InvalidPointers)
        ));
        // Outside any mapping.
        assert!(matches!(
            validate::<u64>(&process, 0x10_0000, false),
            Err(SysResult::InvalidPointers)
        ));
        // Straddles the end of the mapping.
        assert!(matches!(
            validate::<u64>(&process, base + PAGE_SIZES[0] as u64 - 4, false),
            Err(SysResult::InvalidPointers)
        ));
    }

    #[test]
    fn write_access_requires_a_writable_mapping() {
        test_support::ensure_global_frames();
        let _pmm = test_support::lock_pmm();

        let page = test_support::alloc_arena(PAGE_SIZES[0], PAGE_SIZES[0]);
        let vas = Vas::create(false);
        vas.map_vmo(
            Vmo::create_physical(page, PAGE_SIZES[0], 0),
            VirtAddr::new(page.value()),
            MapFlags::USER | MapFlags::READ_ONLY,
        );
        let process = Process::create(vas).expect("fresh VAS should be claimable");

        assert!(validate::<u64>(&process, page.value(), false).is_ok());
        assert!(matches!(
            validate::<u64>(&process, page.value(), true),
            Err(SysResult::InvalidPointers)
        ));
    }
}
