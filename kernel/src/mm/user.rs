//! User-pointer validation and cross-address-space copies
//!
//! Every pointer argument reaching the syscall layer is validated here
//! before any dereference: the address must sit in the user half, be
//! mapped, and carry the User bit (plus Writable for copy-out targets).
//!
//! Copies use a swap-page-table primitive on bare metal: the target
//! process's root is bound, a bounded memcpy runs against the raw user
//! address into a kernel-owned buffer, and the original root is restored.
//! Kernel-half mappings are aliased into every root, so kernel buffers stay
//! visible across the swap. Host builds walk the tables page by page
//! through the test phys mapping instead.

use super::{
    page_table::AddressSpace, PageFlags, VirtualAddress, PAGE_SIZE, USER_SPACE_TOP,
};
use crate::error::{KernelResult, SyscallError};

/// Per-string bound for syscall string arguments (paths, argv entries).
pub const PATH_MAX: usize = 4096;
/// Per-argument cap for execve argv/envp strings.
pub const MAX_ARG: usize = 4096;

/// Validate a user range for the requested access. `write` additionally
/// requires the Writable bit on every page.
pub fn validate_range(
    space: &AddressSpace,
    addr: VirtualAddress,
    len: usize,
    write: bool,
) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let start = addr.as_u64();
    let end = start
        .checked_add(len as u64)
        .ok_or(SyscallError::BadUserPointer { addr: start as usize })?;
    if end > USER_SPACE_TOP {
        return Err(SyscallError::BadUserPointer { addr: start as usize }.into());
    }
    let mut required = PageFlags::USER;
    if write {
        required |= PageFlags::WRITABLE;
    }
    let mut page = start & !(PAGE_SIZE as u64 - 1);
    while page < end {
        if !space.check(VirtualAddress::new(page), required) {
            return Err(SyscallError::BadUserPointer { addr: page as usize }.into());
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Run `f` with `space` bound as the active page table, restoring the
/// caller's root afterwards. The swap is the only way a raw user address
/// of another process becomes dereferenceable.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn with_space<R>(space: &AddressSpace, f: impl FnOnce() -> R) -> R {
    use crate::arch::x86_64::mmu;
    let previous = mmu::read_cr3();
    let target = space.root_phys();
    let swapped = previous != target;
    if swapped {
        mmu::write_cr3(target);
    }
    let result = f();
    if swapped {
        mmu::write_cr3(previous);
    }
    result
}

/// Copy `dst.len()` bytes from `src` in `space` into a kernel buffer.
pub fn copy_from_user(
    space: &AddressSpace,
    src: VirtualAddress,
    dst: &mut [u8],
) -> KernelResult<()> {
    validate_range(space, src, dst.len(), false)?;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        with_space(space, || {
            // SAFETY: the range was validated as mapped user memory in the
            // bound address space, and dst is a live kernel buffer aliased
            // in every root.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_u64() as *const u8,
                    dst.as_mut_ptr(),
                    dst.len(),
                );
            }
        });
        Ok(())
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        copy_via_walk(space, src, dst.len(), |chunk, offset| {
            dst[offset..offset + chunk.len()].copy_from_slice(chunk);
        });
        Ok(())
    }
}

/// Copy a kernel buffer out to `dst` in `space`.
pub fn copy_to_user(space: &AddressSpace, dst: VirtualAddress, src: &[u8]) -> KernelResult<()> {
    validate_range(space, dst, src.len(), true)?;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        with_space(space, || {
            // SAFETY: validated writable user range in the bound space; src
            // is kernel memory aliased in every root.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_u64() as *mut u8, src.len());
            }
        });
        Ok(())
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let mut offset = 0usize;
        let mut va = dst.as_u64();
        let end = dst.as_u64() + src.len() as u64;
        while va < end {
            let page_end = (va & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
            let chunk = (end.min(page_end) - va) as usize;
            let pa = space
                .translate(VirtualAddress::new(va))
                .expect("validated range is mapped");
            // SAFETY: host test frames are heap-backed buffers.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[offset..].as_ptr(),
                    super::phys_to_virt(pa),
                    chunk,
                );
            }
            offset += chunk;
            va += chunk as u64;
        }
        Ok(())
    }
}

/// Page-by-page read walk used on host builds.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn copy_via_walk(
    space: &AddressSpace,
    src: VirtualAddress,
    len: usize,
    mut sink: impl FnMut(&[u8], usize),
) {
    let mut offset = 0usize;
    let mut va = src.as_u64();
    let end = src.as_u64() + len as u64;
    while va < end {
        let page_end = (va & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
        let chunk = (end.min(page_end) - va) as usize;
        let pa = space
            .translate(VirtualAddress::new(va))
            .expect("validated range is mapped");
        // SAFETY: host test frames are heap-backed buffers.
        let slice = unsafe { core::slice::from_raw_parts(super::phys_to_virt(pa), chunk) };
        sink(slice, offset);
        offset += chunk;
        va += chunk as u64;
    }
}

/// Copy a NUL-terminated string from user space, bounded by `cap`. Returns
/// the string length (without the terminator).
pub fn copy_string_from_user(
    space: &AddressSpace,
    src: VirtualAddress,
    buf: &mut [u8],
    cap: usize,
) -> KernelResult<usize> {
    let cap = cap.min(buf.len());
    // Read page-sized chunks until a NUL shows up or the bound trips.
    let mut read = 0usize;
    while read < cap {
        let va = src.add(read as u64);
        let page_end = (va.as_u64() & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64;
        let chunk = ((page_end - va.as_u64()) as usize).min(cap - read);
        copy_from_user(space, va, &mut buf[read..read + chunk])?;
        if let Some(nul) = buf[read..read + chunk].iter().position(|&b| b == 0) {
            return Ok(read + nul);
        }
        read += chunk;
    }
    Err(SyscallError::StringTooLong { max: cap }.into())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;
    use alloc::boxed::Box;

    use super::*;
    use crate::{
        boot::{BootInfo, MemoryRegion, RegionKind},
        error::{Errno, KernelError},
        mm::{
            frame_allocator::FrameAllocator,
            vma::{VmaFlags, VmaSet},
        },
    };

    fn setup(base: u64) -> (Box<FrameAllocator>, AddressSpace, VmaSet) {
        let mut boot = BootInfo::empty();
        boot.push_region(MemoryRegion {
            base: base * PAGE_SIZE as u64,
            length: 512 * PAGE_SIZE as u64,
            kind: RegionKind::Usable,
        });
        let mut fa = Box::new(FrameAllocator::new());
        fa.init(&boot);
        let space = AddressSpace::new(&mut fa).expect("root");
        (fa, space, VmaSet::new())
    }

    #[test]
    fn kernel_pointer_is_rejected() {
        let (_fa, space, _v) = setup(0x11000);
        let mut buf = [0u8; 8];
        let err = copy_from_user(
            &space,
            VirtualAddress::new(crate::mm::KERNEL_VMA + 0x1000),
            &mut buf,
        )
        .expect_err("kernel address must fail validation");
        assert_eq!(Errno::from(err), Errno::EFAULT);
    }

    #[test]
    fn unmapped_pointer_is_rejected() {
        let (_fa, space, _v) = setup(0x12000);
        let mut buf = [0u8; 8];
        let err = copy_from_user(&space, VirtualAddress::new(0x4000_0000), &mut buf)
            .expect_err("unmapped address must fail");
        assert!(matches!(
            err,
            KernelError::Syscall(SyscallError::BadUserPointer { .. })
        ));
    }

    #[test]
    fn copy_roundtrip_across_page_boundary() {
        let (mut fa, space, mut vmas) = setup(0x13000);
        vmas.map_anon(
            &space,
            &mut fa,
            0x4000_0000,
            2 * PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
        )
        .expect("map");

        // Write across the page boundary, read it back.
        let addr = VirtualAddress::new(0x4000_0FF8);
        let payload = *b"0123456789ABCDEF";
        copy_to_user(&space, addr, &payload).expect("copy out");
        let mut readback = [0u8; 16];
        copy_from_user(&space, addr, &mut readback).expect("copy in");
        assert_eq!(readback, payload);
    }

    #[test]
    fn write_to_readonly_page_is_rejected() {
        let (mut fa, space, mut vmas) = setup(0x14000);
        vmas.map_anon(
            &space,
            &mut fa,
            0x4000_0000,
            PAGE_SIZE as u64,
            VmaFlags::READ,
        )
        .expect("ro map");
        let err = copy_to_user(&space, VirtualAddress::new(0x4000_0000), b"x")
            .expect_err("read-only page must reject copy_to_user");
        assert_eq!(Errno::from(err), Errno::EFAULT);
    }

    #[test]
    fn string_copy_respects_bounds() {
        let (mut fa, space, mut vmas) = setup(0x15000);
        vmas.map_anon(
            &space,
            &mut fa,
            0x4000_0000,
            PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE,
        )
        .expect("map");
        copy_to_user(&space, VirtualAddress::new(0x4000_0000), b"/bin/sh\0junk")
            .expect("seed string");

        let mut buf = [0u8; 64];
        let len = copy_string_from_user(
            &space,
            VirtualAddress::new(0x4000_0000),
            &mut buf,
            PATH_MAX,
        )
        .expect("string copy");
        assert_eq!(&buf[..len], b"/bin/sh");

        // No terminator within the cap: ENAMETOOLONG.
        copy_to_user(&space, VirtualAddress::new(0x4000_0000), &[b'A'; 32])
            .expect("unterminated");
        let err = copy_string_from_user(&space, VirtualAddress::new(0x4000_0000), &mut buf, 16)
            .expect_err("unterminated string must trip the bound");
        assert_eq!(Errno::from(err), Errno::ENAMETOOLONG);
    }
}
