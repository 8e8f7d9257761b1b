//! Trapframe layout and exception-syndrome decoding.

/// Snapshot of user registers saved on the kernel stack by the exception
/// vectors. Layout must match the `kernel_entry`/`kernel_exit` assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Trapframe {
    /// General purpose registers x0-x30
    pub x: [u64; 31],
    /// Saved program status
    pub spsr_el1: u64,
    /// Exception return address
    pub elr_el1: u64,
    /// User stack pointer
    pub sp_el0: u64,
}

impl Trapframe {
    /// Was the exception taken from EL0?
    #[inline]
    pub fn from_el0(&self) -> bool {
        self.spsr_el1 & 0b1100 == 0
    }

    /// Syscall return value slot.
    #[inline]
    pub fn set_return(&mut self, value: u64) {
        self.x[0] = value;
    }
}

/// Exception classes we dispatch on (ESR_EL1.EC)
pub const EC_SVC64: u64 = 0b010101;
pub const EC_INST_ABORT_LOWER: u64 = 0b100000;
pub const EC_DATA_ABORT_LOWER: u64 = 0b100100;
pub const EC_DATA_ABORT_SAME: u64 = 0b100101;

/// Decoded view of ESR_EL1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsrInfo(pub u64);

/// What the fault status code says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No valid leaf entry at some walk level: install the page lazily
    Translation,
    /// Leaf present but access denied: copy-on-write candidate
    Permission,
    /// Anything else (alignment, external abort, ...)
    Other,
}

impl EsrInfo {
    /// Exception class, bits [31:26]
    #[inline]
    pub fn ec(&self) -> u64 {
        (self.0 >> 26) & 0x3F
    }

    /// Instruction-specific syndrome, bits [24:0]
    #[inline]
    pub fn iss(&self) -> u64 {
        self.0 & 0x1FF_FFFF
    }

    /// Is this a data or instruction abort from EL0 or a data abort taken
    /// while the kernel touched user memory?
    pub fn is_memory_abort(&self) -> bool {
        matches!(
            self.ec(),
            EC_INST_ABORT_LOWER | EC_DATA_ABORT_LOWER | EC_DATA_ABORT_SAME
        )
    }

    /// Classify the abort from the low six syndrome bits (xFSC).
    pub fn fault_kind(&self) -> FaultKind {
        match self.iss() & 0x3F {
            // Translation fault, levels 0-3
            0b000100..=0b000111 => FaultKind::Translation,
            // Permission fault, levels 1-3
            0b001101..=0b001111 => FaultKind::Permission,
            _ => FaultKind::Other,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn classifies_translation_faults_for_all_levels() {
        for fsc in 0b000100..=0b000111u64 {
            let esr = EsrInfo((EC_DATA_ABORT_LOWER << 26) | fsc);
            assert!(esr.is_memory_abort());
            assert_eq!(esr.fault_kind(), FaultKind::Translation);
        }
    }

    #[test]
    fn classifies_permission_fault() {
        let esr = EsrInfo((EC_DATA_ABORT_LOWER << 26) | 0b001111);
        assert_eq!(esr.fault_kind(), FaultKind::Permission);
    }

    #[test]
    fn svc_is_not_a_memory_abort() {
        let esr = EsrInfo(EC_SVC64 << 26);
        assert!(!esr.is_memory_abort());
        assert_eq!(esr.ec(), EC_SVC64);
    }

    #[test]
    fn el0_detection_reads_spsr_mode_bits() {
        let mut tf = Trapframe {
            x: [0; 31],
            spsr_el1: 0,
            elr_el1: 0,
            sp_el0: 0,
        };
        assert!(tf.from_el0());
        tf.spsr_el1 = 0b0101; // EL1h
        assert!(!tf.from_el0());
    }
}
