//! Kernel bring-up, in dependency order: console, kernel map, early heap,
//! reservations, frame allocator, timers, scheduler, filesystems, first
//! user program.

#[cfg(target_arch = "aarch64")]
use crate::{drivers, fs, mm, sched, sync, timer};

/// Entry from the boot stub, running on the boot stack with BSS cleared.
#[cfg(target_arch = "aarch64")]
#[no_mangle]
pub extern "C" fn kernel_main(dtb_phys: usize) -> ! {
    // Refine the boot map first so device registers are device memory.
    // SAFETY: runs once, before any driver touches MMIO.
    unsafe { mm::page_table::init_kernel_2mb_map() };

    drivers::uart::init();
    crate::klog::init();
    crate::println!();
    log::info!(
        "lichen-kernel {} booting, dtb at {:#x}",
        env!("CARGO_PKG_VERSION"),
        dtb_phys
    );

    mm::early::init();
    let boot_info = drivers::dtb::read_boot_info(dtb_phys);
    mm::init(&boot_info.reserved);

    if let Some((start, end)) = boot_info.initrd {
        // SAFETY: the range is reserved from the allocator and lives for
        // the kernel's lifetime.
        let archive = unsafe {
            core::slice::from_raw_parts(
                mm::PhysicalAddress::new(start).to_virt() as *const u8,
                end - start,
            )
        };
        fs::initramfs::set_archive(archive);
        log::info!("initramfs: {:#x}..{:#x}", start, end);
    }

    timer::init();
    sched::init();
    fs::init_rootfs();

    match drivers::sdhost::SdHost::probe() {
        Ok(sd) => match fs::fat32::register(sd) {
            Ok(_) => {
                let _ = fs::mkdir("/boot");
                match fs::mount("/boot", "fat32") {
                    Ok(()) => log::info!("fat32 volume mounted on /boot"),
                    Err(e) => log::warn!("fat32 mount failed: {:?}", e),
                }
            }
            Err(e) => log::warn!("fat32 probe failed: {:?}", e),
        },
        Err(e) => log::warn!("no sd card: {:?}", e),
    }

    sync::set_init_done();
    log::info!("boot complete");

    if let Err(e) = sched::exec::exec_first("/initramfs/init") {
        log::warn!("no init program: {}", e);
    }
    sched::idle_loop()
}

/// Host builds have no boot path; the library exists for its unit tests.
#[cfg(not(target_arch = "aarch64"))]
pub extern "C" fn kernel_main(_dtb_phys: usize) -> ! {
    unimplemented!("kernel_main only runs on the target")
}
