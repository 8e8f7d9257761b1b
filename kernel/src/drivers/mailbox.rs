//! VideoCore mailbox property interface (channel 8).
//!
//! The ARM posts a 16-byte-aligned buffer address on the write register
//! after the FULL flag clears, then polls the read register for the
//! matching reply.

use spin::Mutex;
use tock_registers::{
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, WriteOnly},
};

use crate::config::KERNEL_VIRT_OFFSET;
use crate::drivers::mmio::MMIODerefWrapper;

register_bitfields! {
    u32,

    STATUS [
        /// No space for another request
        FULL OFFSET(31) NUMBITS(1) [],
        /// No replies waiting
        EMPTY OFFSET(30) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub MailboxRegisterBlock {
        (0x00 => READ: ReadOnly<u32>),
        (0x04 => _reserved1),
        (0x18 => STATUS: ReadOnly<u32, STATUS::Register>),
        (0x1C => _reserved2),
        (0x20 => WRITE: WriteOnly<u32>),
        (0x24 => @END),
    }
}

// SAFETY: fixed BCM2837 mailbox address behind the boot-mapped device
// window, aliased into the kernel half.
static MBOX_REGS: MMIODerefWrapper<MailboxRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x3F00_B880) };

pub const MBOX_REQUEST: u32 = 0;
pub const MBOX_RESPONSE_OK: u32 = 0x8000_0000;
pub const MBOX_CH_PROP: u8 = 8;
pub const MBOX_TAG_LAST: u32 = 0;

/// The GPU requires a 16-byte-aligned message buffer.
#[repr(C, align(16))]
pub struct MboxBuffer(pub [u32; 36]);

/// The kernel's one message buffer; user `mbox_call` payloads are copied
/// through it.
pub static MBOX: Mutex<MboxBuffer> = Mutex::new(MboxBuffer([0; 36]));

/// Post the shared buffer on `channel` and wait for the matching reply.
/// Returns true when the firmware acknowledged the request.
pub fn call(channel: u8) -> bool {
    // No GPU to answer on the host build.
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = channel;
        return false;
    }
    #[cfg(target_arch = "aarch64")]
    {
        call_hw(channel)
    }
}

#[cfg(target_arch = "aarch64")]
fn call_hw(channel: u8) -> bool {
    let buffer = MBOX.lock();
    // The GPU sees physical addresses; the low nibble selects the channel.
    let addr = crate::mm::virt_to_phys(&buffer.0 as *const u32 as usize) as u32;
    let message = (addr & !0xF) | (u32::from(channel) & 0xF);

    while MBOX_REGS.STATUS.is_set(STATUS::FULL) {
        core::hint::spin_loop();
    }
    MBOX_REGS.WRITE.set(message);

    loop {
        while MBOX_REGS.STATUS.is_set(STATUS::EMPTY) {
            core::hint::spin_loop();
        }
        if MBOX_REGS.READ.get() == message {
            return buffer.0[1] == MBOX_RESPONSE_OK;
        }
    }
}

/// Run a property call with `msg` staged through the shared buffer; the
/// reply is copied back over `msg`. This is the syscall 6 backend.
pub fn property_call(msg: &mut [u32]) -> bool {
    crate::sync::lock();
    let ok = {
        let len = msg.len().min(36);
        {
            let mut buffer = MBOX.lock();
            buffer.0[..len].copy_from_slice(&msg[..len]);
        }
        let ok = call(MBOX_CH_PROP);
        {
            let buffer = MBOX.lock();
            msg[..len].copy_from_slice(&buffer.0[..len]);
        }
        ok
    };
    crate::sync::unlock();
    ok
}
