//! Minimal ELF64 executable loader
//!
//! Loads static `ET_EXEC` x86_64 images: PT_LOAD segments are mapped as
//! anonymous areas with the segment's permissions and filled from the
//! file bytes. Dynamic linking, relocation and PIE are out of scope; the
//! user-mode loader handles those.

extern crate alloc;

use crate::{
    error::{KernelError, KernelResult, SyscallError},
    mm::{
        frame_allocator::FrameAllocator, page_table::AddressSpace, user, vma::VmaFlags,
        vma::VmaSet, VirtualAddress, PAGE_SIZE,
    },
};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LE: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    data.get(off..off + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// One loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: u32,
}

impl Segment {
    pub fn vma_flags(&self) -> VmaFlags {
        let mut flags = VmaFlags::empty();
        if self.flags & PF_R != 0 {
            flags |= VmaFlags::READ;
        }
        if self.flags & PF_W != 0 {
            flags |= VmaFlags::WRITE;
        }
        if self.flags & PF_X != 0 {
            flags |= VmaFlags::EXEC;
        }
        flags
    }
}

/// Parsed image: entry point plus its PT_LOAD segments.
#[derive(Debug, Clone)]
pub struct Image {
    pub entry: u64,
    pub segments: alloc::vec::Vec<Segment>,
}

/// Parse an ELF64 executable header and its program headers.
pub fn parse(data: &[u8]) -> KernelResult<Image> {
    if data.len() < 64 || data[..4] != ELF_MAGIC {
        return Err(KernelError::Syscall(SyscallError::InvalidArgument));
    }
    if data[4] != CLASS_64 || data[5] != DATA_LE {
        return Err(KernelError::NotSupported {
            operation: "non-64-bit or big-endian ELF",
        });
    }
    let e_type = read_u16(data, 16).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
    let machine = read_u16(data, 18).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
    if e_type != ET_EXEC {
        return Err(KernelError::NotSupported {
            operation: "non-ET_EXEC ELF image",
        });
    }
    if machine != EM_X86_64 {
        return Err(KernelError::NotSupported {
            operation: "foreign-architecture ELF image",
        });
    }

    let entry = read_u64(data, 24).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
    let phoff = read_u64(data, 32).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
    let phentsize =
        read_u16(data, 54).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))? as u64;
    let phnum = read_u16(data, 56).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;

    let mut segments = alloc::vec::Vec::new();
    for i in 0..phnum as u64 {
        let base = (phoff + i * phentsize) as usize;
        let p_type = read_u32(data, base).ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        if p_type != PT_LOAD {
            continue;
        }
        let flags = read_u32(data, base + 4)
            .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        let offset = read_u64(data, base + 8)
            .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        let vaddr = read_u64(data, base + 16)
            .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        let file_size = read_u64(data, base + 32)
            .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        let mem_size = read_u64(data, base + 40)
            .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
        if mem_size < file_size || offset + file_size > data.len() as u64 {
            return Err(KernelError::Syscall(SyscallError::InvalidArgument));
        }
        segments.push(Segment {
            vaddr,
            offset,
            file_size,
            mem_size,
            flags,
        });
    }
    if segments.is_empty() {
        return Err(KernelError::NotSupported {
            operation: "ELF image with no loadable segments",
        });
    }
    Ok(Image { entry, segments })
}

/// Map and fill the image's segments in `space`. Segments are written
/// through a writable mapping first, then narrowed to their landed
/// permissions; bss beyond the file bytes stays zero from the anonymous
/// mapping.
pub fn load(
    image: &Image,
    data: &[u8],
    space: &AddressSpace,
    vmas: &mut VmaSet,
    frames: &mut FrameAllocator,
) -> KernelResult<u64> {
    for segment in &image.segments {
        let start = segment.vaddr & !(PAGE_SIZE as u64 - 1);
        let end = (segment.vaddr + segment.mem_size).next_multiple_of(PAGE_SIZE as u64);
        let len = end - start;

        vmas.map_anon(
            space,
            frames,
            start,
            len,
            segment.vma_flags() | VmaFlags::WRITE,
        )?;
        let bytes = &data[segment.offset as usize..(segment.offset + segment.file_size) as usize];
        user::copy_to_user(space, VirtualAddress::new(segment.vaddr), bytes)?;
        if !segment.vma_flags().contains(VmaFlags::WRITE) {
            vmas.protect(space, frames, start, len, segment.vma_flags())?;
        }
    }
    Ok(image.entry)
}

/// Test-image builder shared by the unit and integration tests.
#[cfg(all(test, not(target_os = "none")))]
pub mod testing {
    extern crate alloc;
    use alloc::vec;

    use super::{CLASS_64, DATA_LE, ELF_MAGIC, EM_X86_64, ET_EXEC, PF_R, PF_X, PT_LOAD};

    /// A one-segment ET_EXEC image: entry 0x40_1000, code bytes at file
    /// offset 0x1000.
    pub fn tiny_elf(code: &[u8]) -> alloc::vec::Vec<u8> {
        let mut image = vec![0u8; 0x1000 + code.len()];
        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = CLASS_64;
        image[5] = DATA_LE;
        image[6] = 1; // version
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        image[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // e_entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        // Program header at offset 64.
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&0x1000u64.to_le_bytes()); // offset
        image[ph + 16..ph + 24].copy_from_slice(&0x40_1000u64.to_le_bytes()); // vaddr
        image[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // filesz
        image[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64 + 64).to_le_bytes()); // memsz (with bss)

        image[0x1000..0x1000 + code.len()].copy_from_slice(code);
        image
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate alloc;

    use super::testing::tiny_elf;
    use super::*;
    use crate::boot::{BootInfo, MemoryRegion, RegionKind};

    #[test]
    fn parse_accepts_wellformed_image() {
        let data = tiny_elf(&[0x90, 0x90, 0xC3]);
        let image = parse(&data).expect("parse");
        assert_eq!(image.entry, 0x40_1000);
        assert_eq!(image.segments.len(), 1);
        let seg = image.segments[0];
        assert_eq!(seg.vaddr, 0x40_1000);
        assert_eq!(seg.file_size, 3);
        assert_eq!(seg.mem_size, 3 + 64);
        assert!(seg.vma_flags().contains(VmaFlags::EXEC));
        assert!(!seg.vma_flags().contains(VmaFlags::WRITE));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse(b"not an elf").is_err());
        let mut bad = tiny_elf(&[0xC3]);
        bad[4] = 1; // 32-bit class
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn load_maps_and_fills() {
        let mut boot = BootInfo::empty();
        boot.push_region(MemoryRegion {
            base: 0x2_0000 * PAGE_SIZE as u64,
            length: 512 * PAGE_SIZE as u64,
            kind: RegionKind::Usable,
        });
        let mut frames = alloc::boxed::Box::new(FrameAllocator::new());
        frames.init(&boot);
        let space = AddressSpace::new(&mut frames).expect("root");
        let mut vmas = VmaSet::new();

        let code = [0x48u8, 0x31, 0xC0, 0xC3];
        let data = tiny_elf(&code);
        let image = parse(&data).expect("parse");
        let entry = load(&image, &data, &space, &mut vmas, &mut frames).expect("load");
        assert_eq!(entry, 0x40_1000);

        // The code bytes landed at the entry address.
        let mut readback = [0u8; 4];
        user::copy_from_user(&space, VirtualAddress::new(0x40_1000), &mut readback)
            .expect("read code back");
        assert_eq!(readback, code);

        // Execute-only segment: no write permission after load.
        use crate::mm::PageFlags;
        assert!(!space.check(VirtualAddress::new(0x40_1000), PageFlags::WRITABLE));
        assert!(!space.check(VirtualAddress::new(0x40_1000), PageFlags::NO_EXECUTE));
    }
}
