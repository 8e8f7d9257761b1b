//! BCM2835 SDHOST controller: the narrow block-device contract the FAT32
//! driver consumes. Single-block PIO transfers only.

use alloc::sync::Arc;

use spin::Mutex;
use tock_registers::{
    fields::FieldValue,
    interfaces::{Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite, WriteOnly},
};

use crate::config::KERNEL_VIRT_OFFSET;
use crate::drivers::mmio::MMIODerefWrapper;
use crate::error::{FsError, FsResult};
use crate::fs::blockdev::{BlockDevice, BLOCK_SIZE};

register_bitfields! {
    u32,

    /// Command register
    SDCMD [
        /// Set to start the command; clears on completion
        NEW_FLAG OFFSET(15) NUMBITS(1) [],
        /// Command failed
        FAIL_FLAG OFFSET(14) NUMBITS(1) [],
        /// Card signalled busy after the command
        BUSY_CMD OFFSET(11) NUMBITS(1) [],
        /// Command has no response phase
        NO_RESPONSE OFFSET(10) NUMBITS(1) [],
        /// 136-bit response
        LONG_RESPONSE OFFSET(9) NUMBITS(1) [],
        /// Data transfer from host to card
        WRITE_CMD OFFSET(7) NUMBITS(1) [],
        /// Data transfer from card to host
        READ_CMD OFFSET(6) NUMBITS(1) [],
        /// SD command index
        COMMAND OFFSET(0) NUMBITS(6) []
    ],

    /// Host status register (write bits back to clear them)
    SDHSTS [
        /// CRC, timeout and FIFO error conditions
        ERROR OFFSET(3) NUMBITS(5) [],
        /// Data FIFO ready
        DATA_FLAG OFFSET(0) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub SdhostRegisterBlock {
        (0x00 => SDCMD: ReadWrite<u32, SDCMD::Register>),
        (0x04 => SDARG: WriteOnly<u32>),
        (0x08 => SDTOUT: WriteOnly<u32>),
        (0x0C => SDCDIV: WriteOnly<u32>),
        (0x10 => SDRSP0: ReadOnly<u32>),
        (0x14 => _reserved1),
        (0x20 => SDHSTS: ReadWrite<u32, SDHSTS::Register>),
        (0x24 => _reserved2),
        (0x30 => SDVDD: WriteOnly<u32>),
        (0x34 => _reserved3),
        (0x38 => SDHCFG: WriteOnly<u32>),
        (0x3C => _reserved4),
        (0x40 => SDDATA: ReadWrite<u32>),
        (0x44 => _reserved5),
        (0x50 => SDHBCT: WriteOnly<u32>),
        (0x54 => SDHBLC: WriteOnly<u32>),
        (0x58 => @END),
    }
}

// SAFETY: fixed BCM2835 SDHOST address behind the boot-mapped device
// window, aliased into the kernel half.
static SDHOST_REGS: MMIODerefWrapper<SdhostRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x3F20_2000) };

const GO_IDLE_STATE: u32 = 0;
const SEND_IF_COND: u32 = 8;
const APP_CMD: u32 = 55;
const APP_SEND_OP_COND: u32 = 41;
const ALL_SEND_CID: u32 = 2;
const SEND_RELATIVE_ADDR: u32 = 3;
const SELECT_CARD: u32 = 7;
const SET_BLOCKLEN: u32 = 16;
const READ_SINGLE_BLOCK: u32 = 17;
const WRITE_SINGLE_BLOCK: u32 = 24;

/// An initialized SD card behind the SDHOST controller.
pub struct SdHost {
    /// High-capacity cards address by block, standard ones by byte
    high_capacity: bool,
    /// Serializes command/data sequences
    op: Mutex<()>,
}

/// Issue one command and wait for completion.
fn issue(command: FieldValue<u32, SDCMD::Register>, arg: u32) -> FsResult<()> {
    while SDHOST_REGS.SDCMD.is_set(SDCMD::NEW_FLAG) {
        core::hint::spin_loop();
    }
    SDHOST_REGS.SDARG.set(arg);
    SDHOST_REGS.SDCMD.write(command + SDCMD::NEW_FLAG::SET);
    loop {
        let status = SDHOST_REGS.SDCMD.extract();
        if !status.is_set(SDCMD::NEW_FLAG) {
            if status.is_set(SDCMD::FAIL_FLAG) {
                return Err(FsError::Io);
            }
            return Ok(());
        }
        core::hint::spin_loop();
    }
}

fn wait_for_data() -> FsResult<()> {
    loop {
        let status = SDHOST_REGS.SDHSTS.extract();
        if status.read(SDHSTS::ERROR) != 0 {
            SDHOST_REGS.SDHSTS.set(status.get());
            return Err(FsError::Io);
        }
        if status.is_set(SDHSTS::DATA_FLAG) {
            SDHOST_REGS.SDHSTS.write(SDHSTS::DATA_FLAG::SET);
            return Ok(());
        }
    }
}

impl SdHost {
    /// Go through the card identification dance. Fails when no usable card
    /// answers.
    pub fn probe() -> FsResult<Arc<SdHost>> {
        SDHOST_REGS.SDVDD.set(1);
        SDHOST_REGS.SDTOUT.set(0xF0_0000);
        SDHOST_REGS.SDCDIV.set(0x148); // ~400 kHz for identification
        SDHOST_REGS.SDHCFG.set(0);
        SDHOST_REGS.SDHBCT.set(BLOCK_SIZE as u32);
        SDHOST_REGS.SDHBLC.set(1);

        issue(
            SDCMD::COMMAND.val(GO_IDLE_STATE) + SDCMD::NO_RESPONSE::SET,
            0,
        )?;
        // Voltage check; 2.7-3.6 V with pattern 0xAA.
        issue(SDCMD::COMMAND.val(SEND_IF_COND), 0x1AA)?;

        // ACMD41 until the card leaves the busy state.
        let mut high_capacity = false;
        for _ in 0..10_000 {
            issue(SDCMD::COMMAND.val(APP_CMD), 0)?;
            issue(
                SDCMD::COMMAND.val(APP_SEND_OP_COND),
                0x00FF_8000 | (1 << 30),
            )?;
            let ocr = SDHOST_REGS.SDRSP0.get();
            if ocr & (1 << 31) != 0 {
                high_capacity = ocr & (1 << 30) != 0;
                break;
            }
        }

        issue(
            SDCMD::COMMAND.val(ALL_SEND_CID) + SDCMD::LONG_RESPONSE::SET,
            0,
        )?;
        issue(SDCMD::COMMAND.val(SEND_RELATIVE_ADDR), 0)?;
        let rca = SDHOST_REGS.SDRSP0.get() & 0xFFFF_0000;
        issue(SDCMD::COMMAND.val(SELECT_CARD), rca)?;
        issue(SDCMD::COMMAND.val(SET_BLOCKLEN), BLOCK_SIZE as u32)?;

        SDHOST_REGS.SDCDIV.set(2); // full speed for data
        log::info!(
            "sdhost: card ready ({} addressing)",
            if high_capacity { "block" } else { "byte" }
        );

        Ok(Arc::new(SdHost {
            high_capacity,
            op: Mutex::new(()),
        }))
    }

    fn data_address(&self, idx: u32) -> u32 {
        if self.high_capacity {
            idx
        } else {
            idx * BLOCK_SIZE as u32
        }
    }
}

impl BlockDevice for SdHost {
    fn read_block(&self, idx: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        let _guard = self.op.lock();
        issue(
            SDCMD::COMMAND.val(READ_SINGLE_BLOCK) + SDCMD::READ_CMD::SET,
            self.data_address(idx),
        )?;
        for word in buf.chunks_exact_mut(4) {
            wait_for_data()?;
            word.copy_from_slice(&SDHOST_REGS.SDDATA.get().to_le_bytes());
        }
        Ok(())
    }

    fn write_block(&self, idx: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        let _guard = self.op.lock();
        issue(
            SDCMD::COMMAND.val(WRITE_SINGLE_BLOCK) + SDCMD::WRITE_CMD::SET,
            self.data_address(idx),
        )?;
        for word in buf.chunks_exact(4) {
            wait_for_data()?;
            SDHOST_REGS
                .SDDATA
                .set(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }
        Ok(())
    }
}
