//! Kernel binary entry

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot_entry {
    use bootloader_api::{config::Mapping, entry_point, BootloaderConfig};

    static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(info: &'static mut bootloader_api::BootInfo) -> ! {
        let boot = ferrite_kernel::boot::from_bootloader(info);
        ferrite_kernel::bootstrap(boot)
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        ferrite_kernel::crash::report::panic_report(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel image only does real work on a bare-metal target; the
    // host build exists for `cargo test`.
    eprintln!("ferrite-kernel: build for x86_64-unknown-none to boot this binary");
}
