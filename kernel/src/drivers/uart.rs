//! Mini UART (AUX) driver with IRQ-driven ring buffers.
//!
//! Synchronous output (`write_str_blocking`) polls the line-status register
//! and is used by the console macros. The asynchronous path buffers RX and
//! TX in software rings; the IRQ router posts the drain handlers as
//! deferred tasks at UART priority.
//!
//! Register layout per the BCM2837 peripheral manual: the AUX block
//! carrying the mini UART, the GPIO block for pins 14/15 (ALT5), and the
//! second-level interrupt controller where AUX is IRQ 29.

use spin::Mutex;
use tock_registers::{
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields, register_structs,
    registers::{ReadOnly, ReadWrite, WriteOnly},
};

use crate::config::KERNEL_VIRT_OFFSET;
use crate::drivers::mmio::MMIODerefWrapper;

register_bitfields! {
    u32,

    /// Auxiliary enables
    AUX_ENABLES [
        /// Gates the mini UART and access to its registers
        MINI_UART_ENABLE OFFSET(0) NUMBITS(1) []
    ],

    /// Mini UART interrupt enable
    AUX_MU_IER [
        /// Interrupt when the transmit FIFO is empty
        TX_ENABLE OFFSET(1) NUMBITS(1) [],
        /// Interrupt when the receive FIFO holds a byte
        RX_ENABLE OFFSET(0) NUMBITS(1) []
    ],

    /// Mini UART interrupt identify
    AUX_MU_IIR [
        /// On write: clear the FIFOs
        FIFO_CLEAR OFFSET(1) NUMBITS(2) [
            Rx = 0b01,
            Tx = 0b10,
            All = 0b11
        ],
        /// On read: which condition is signalling
        INT_ID OFFSET(1) NUMBITS(2) [
            TxEmpty = 0b01,
            RxReady = 0b10
        ]
    ],

    /// Mini UART line control
    AUX_MU_LCR [
        DATA_SIZE OFFSET(0) NUMBITS(2) [
            SevenBit = 0b00,
            EightBit = 0b11
        ]
    ],

    /// Mini UART line status
    AUX_MU_LSR [
        /// Transmit FIFO can accept at least one byte
        TX_EMPTY OFFSET(5) NUMBITS(1) [],
        /// Receive FIFO holds at least one byte
        DATA_READY OFFSET(0) NUMBITS(1) []
    ],

    /// Mini UART extra control
    AUX_MU_CNTL [
        TX_EN OFFSET(1) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1
        ],
        RX_EN OFFSET(0) NUMBITS(1) [
            Disabled = 0,
            Enabled = 1
        ]
    ],

    /// Mini UART baud rate divisor
    AUX_MU_BAUD [
        RATE OFFSET(0) NUMBITS(16) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub AuxRegisterBlock {
        (0x00 => _reserved1),
        (0x04 => AUX_ENABLES: ReadWrite<u32, AUX_ENABLES::Register>),
        (0x08 => _reserved2),
        (0x40 => AUX_MU_IO: ReadWrite<u32>),
        (0x44 => AUX_MU_IER: ReadWrite<u32, AUX_MU_IER::Register>),
        (0x48 => AUX_MU_IIR: ReadWrite<u32, AUX_MU_IIR::Register>),
        (0x4C => AUX_MU_LCR: ReadWrite<u32, AUX_MU_LCR::Register>),
        (0x50 => AUX_MU_MCR: ReadWrite<u32>),
        (0x54 => AUX_MU_LSR: ReadOnly<u32, AUX_MU_LSR::Register>),
        (0x58 => _reserved3),
        (0x60 => AUX_MU_CNTL: ReadWrite<u32, AUX_MU_CNTL::Register>),
        (0x64 => _reserved4),
        (0x68 => AUX_MU_BAUD: WriteOnly<u32, AUX_MU_BAUD::Register>),
        (0x6C => @END),
    }
}

register_bitfields! {
    u32,

    /// GPIO function select 1 (pins 10-19)
    GPFSEL1 [
        /// Pin 15: RXD1 on ALT5
        FSEL15 OFFSET(15) NUMBITS(3) [
            Input = 0b000,
            AltFunc5 = 0b010
        ],
        /// Pin 14: TXD1 on ALT5
        FSEL14 OFFSET(12) NUMBITS(3) [
            Input = 0b000,
            AltFunc5 = 0b010
        ]
    ],

    /// GPIO pull-up/down mode
    GPPUD [
        PUD OFFSET(0) NUMBITS(2) [
            Off = 0b00,
            PullDown = 0b01,
            PullUp = 0b10
        ]
    ],

    /// GPIO pull-up/down clock for pins 0-31
    GPPUDCLK0 [
        PUDCLK15 OFFSET(15) NUMBITS(1) [
            NoEffect = 0,
            AssertClock = 1
        ],
        PUDCLK14 OFFSET(14) NUMBITS(1) [
            NoEffect = 0,
            AssertClock = 1
        ]
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub GpioRegisterBlock {
        (0x00 => _reserved1),
        (0x04 => GPFSEL1: ReadWrite<u32, GPFSEL1::Register>),
        (0x08 => _reserved2),
        (0x94 => GPPUD: ReadWrite<u32, GPPUD::Register>),
        (0x98 => GPPUDCLK0: ReadWrite<u32, GPPUDCLK0::Register>),
        (0x9C => @END),
    }
}

register_bitfields! {
    u32,

    /// Second-level interrupt controller: pending IRQs 0-31
    IRQ_PENDING_1 [
        /// IRQ 29: the AUX block (mini UART)
        AUX OFFSET(29) NUMBITS(1) []
    ],

    /// Second-level interrupt controller: enable IRQs 0-31
    ENABLE_IRQS_1 [
        AUX OFFSET(29) NUMBITS(1) []
    ]
}

register_structs! {
    #[allow(non_snake_case)]
    pub IntcRegisterBlock {
        (0x00 => _reserved1),
        (0x04 => IRQ_PENDING_1: ReadOnly<u32, IRQ_PENDING_1::Register>),
        (0x08 => _reserved2),
        (0x10 => ENABLE_IRQS_1: WriteOnly<u32, ENABLE_IRQS_1::Register>),
        (0x14 => @END),
    }
}

// SAFETY: fixed BCM2837 peripheral addresses behind the boot-mapped device
// window, aliased into the kernel half.
static AUX_REGS: MMIODerefWrapper<AuxRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x3F21_5000) };
static GPIO_REGS: MMIODerefWrapper<GpioRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x3F20_0000) };
static INTC_REGS: MMIODerefWrapper<IntcRegisterBlock> =
    unsafe { MMIODerefWrapper::new(KERNEL_VIRT_OFFSET + 0x3F00_B200) };

/// Which mini-UART condition raised the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    Rx,
    Tx,
}

/// Fixed-capacity byte ring.
pub struct RingBuffer {
    buf: [u8; Self::CAPACITY],
    head: usize,
    tail: usize,
}

impl RingBuffer {
    pub const CAPACITY: usize = 1024;

    pub const fn new() -> Self {
        Self {
            buf: [0; Self::CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.head + 1) % Self::CAPACITY == self.tail
    }

    /// Push a byte; the oldest byte is lost when full.
    pub fn push(&mut self, byte: u8) {
        if self.is_full() {
            self.tail = (self.tail + 1) % Self::CAPACITY;
        }
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % Self::CAPACITY;
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let byte = self.buf[self.tail];
        self.tail = (self.tail + 1) % Self::CAPACITY;
        Some(byte)
    }

    pub fn len(&self) -> usize {
        (self.head + Self::CAPACITY - self.tail) % Self::CAPACITY
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

static RX_BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());
static TX_BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

/// Settle time after pull-up/down changes, per the GPIO manual.
fn cycle_delay(cycles: usize) {
    for _ in 0..cycles {
        core::hint::spin_loop();
    }
}

/// Program the mini UART for 115200 8N1 on GPIO 14/15 and unmask its IRQ
/// at the second-level controller.
pub fn init() {
    AUX_REGS.AUX_ENABLES.modify(AUX_ENABLES::MINI_UART_ENABLE::SET);
    AUX_REGS
        .AUX_MU_CNTL
        .write(AUX_MU_CNTL::TX_EN::Disabled + AUX_MU_CNTL::RX_EN::Disabled);
    AUX_REGS.AUX_MU_IER.set(0);
    AUX_REGS.AUX_MU_LCR.write(AUX_MU_LCR::DATA_SIZE::EightBit);
    AUX_REGS.AUX_MU_MCR.set(0);
    AUX_REGS.AUX_MU_BAUD.write(AUX_MU_BAUD::RATE.val(270)); // 115200 @ 250 MHz core
    AUX_REGS.AUX_MU_IIR.write(AUX_MU_IIR::FIFO_CLEAR::All);

    // Pins 14/15 to ALT5, pulls off.
    GPIO_REGS
        .GPFSEL1
        .modify(GPFSEL1::FSEL14::AltFunc5 + GPFSEL1::FSEL15::AltFunc5);
    GPIO_REGS.GPPUD.write(GPPUD::PUD::Off);
    cycle_delay(150);
    GPIO_REGS
        .GPPUDCLK0
        .write(GPPUDCLK0::PUDCLK14::AssertClock + GPPUDCLK0::PUDCLK15::AssertClock);
    cycle_delay(150);
    GPIO_REGS.GPPUDCLK0.set(0);

    AUX_REGS
        .AUX_MU_CNTL
        .write(AUX_MU_CNTL::TX_EN::Enabled + AUX_MU_CNTL::RX_EN::Enabled);
    INTC_REGS.ENABLE_IRQS_1.write(ENABLE_IRQS_1::AUX::SET);
    AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::RX_ENABLE::SET);
}

/// Synchronous, polling console output.
pub fn write_str_blocking(s: &str) {
    for b in s.bytes() {
        if b == b'\n' {
            putc_blocking(b'\r');
        }
        putc_blocking(b);
    }
}

fn putc_blocking(byte: u8) {
    while !AUX_REGS.AUX_MU_LSR.is_set(AUX_MU_LSR::TX_EMPTY) {
        core::hint::spin_loop();
    }
    AUX_REGS.AUX_MU_IO.set(byte as u32);
}

/// Asynchronous read: take from the RX ring, sleeping on `wfi` with the RX
/// interrupt enabled until data arrives.
pub fn getc_async() -> u8 {
    loop {
        crate::sync::lock();
        let byte = RX_BUFFER.lock().pop();
        crate::sync::unlock();
        match byte {
            Some(b) => return b,
            None => {
                AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::RX_ENABLE::SET);
                crate::arch::wait_for_interrupt();
            }
        }
    }
}

/// Asynchronous write: stage in the TX ring and let the TX interrupt drain
/// it.
pub fn putc_async(byte: u8) {
    crate::sync::lock();
    TX_BUFFER.lock().push(byte);
    crate::sync::unlock();
    AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::TX_ENABLE::SET);
}

/// Is the AUX interrupt pending at the second-level controller?
pub fn has_pending_irq() -> bool {
    INTC_REGS.IRQ_PENDING_1.is_set(IRQ_PENDING_1::AUX)
}

/// Which condition is the mini UART signalling?
pub fn pending_kind() -> Option<IrqKind> {
    match AUX_REGS.AUX_MU_IIR.read(AUX_MU_IIR::INT_ID) {
        0b10 => Some(IrqKind::Rx),
        0b01 => Some(IrqKind::Tx),
        _ => None,
    }
}

/// Mask the RX interrupt until the deferred handler has drained the FIFO.
pub fn mask_rx_irq() {
    AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::RX_ENABLE::CLEAR);
}

/// Mask the TX interrupt until the deferred handler refills the FIFO.
pub fn mask_tx_irq() {
    AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::TX_ENABLE::CLEAR);
}

/// Deferred RX task: move everything in the hardware FIFO into the ring,
/// then re-enable the RX interrupt.
pub fn rx_task(_arg: u64) {
    crate::sync::lock();
    {
        let mut rx = RX_BUFFER.lock();
        while AUX_REGS.AUX_MU_LSR.is_set(AUX_MU_LSR::DATA_READY) {
            rx.push(AUX_REGS.AUX_MU_IO.get() as u8);
        }
    }
    crate::sync::unlock();
    AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::RX_ENABLE::SET);
}

/// Deferred TX task: feed the FIFO from the ring; leave the TX interrupt
/// masked once the ring is empty.
pub fn tx_task(_arg: u64) {
    crate::sync::lock();
    let more = {
        let mut tx = TX_BUFFER.lock();
        while !tx.is_empty() && AUX_REGS.AUX_MU_LSR.is_set(AUX_MU_LSR::TX_EMPTY) {
            if let Some(b) = tx.pop() {
                AUX_REGS.AUX_MU_IO.set(b as u32);
            }
        }
        !tx.is_empty()
    };
    crate::sync::unlock();
    if more {
        AUX_REGS.AUX_MU_IER.modify(AUX_MU_IER::TX_ENABLE::SET);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo() {
        let mut ring = RingBuffer::new();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
        for b in 0..10u8 {
            ring.push(b);
        }
        assert_eq!(ring.len(), 10);
        for b in 0..10u8 {
            assert_eq!(ring.pop(), Some(b));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = RingBuffer::new();
        for i in 0..(RingBuffer::CAPACITY + 5) {
            ring.push((i % 256) as u8);
        }
        assert_eq!(ring.len(), RingBuffer::CAPACITY - 1);
        // The first bytes pushed are gone; the ring starts later.
        let first = ring.pop().expect("non-empty");
        assert_ne!(first, 0);
    }
}
