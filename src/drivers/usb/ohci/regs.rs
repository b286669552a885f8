//! OHCI Register Definitions using tock-registers
//!
//! This module defines the OHCI (USB 1.1) Open Host Controller Interface
//! operational registers using type-safe tock-registers, plus the
//! [`RegisterAccess`] seam the transfer engine uses to reach them.
//!
//! # References
//! - OpenHCI Specification 1.0a, chapter 7

use core::ptr::NonNull;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

// ============================================================================
// Control and Status Partition
// ============================================================================

register_bitfields! [
    u32,
    /// HcRevision - offset 0x00
    pub HC_REVISION [
        /// BCD revision of the OpenHCI specification (0x10)
        REV OFFSET(0) NUMBITS(8) []
    ],

    /// HcControl - offset 0x04
    pub HC_CONTROL [
        /// Control/Bulk Service Ratio
        CBSR OFFSET(0) NUMBITS(2) [],
        /// Periodic List Enable
        PLE OFFSET(2) NUMBITS(1) [],
        /// Isochronous Enable
        IE OFFSET(3) NUMBITS(1) [],
        /// Control List Enable
        CLE OFFSET(4) NUMBITS(1) [],
        /// Bulk List Enable
        BLE OFFSET(5) NUMBITS(1) [],
        /// Host Controller Functional State
        HCFS OFFSET(6) NUMBITS(2) [
            Reset = 0,
            Resume = 1,
            Operational = 2,
            Suspend = 3
        ],
        /// Interrupt Routing (SMM)
        IR OFFSET(8) NUMBITS(1) [],
        /// Remote Wakeup Connected
        RWC OFFSET(9) NUMBITS(1) [],
        /// Remote Wakeup Enable
        RWE OFFSET(10) NUMBITS(1) []
    ],

    /// HcCommandStatus - offset 0x08
    pub HC_COMMAND_STATUS [
        /// Host Controller Reset
        HCR OFFSET(0) NUMBITS(1) [],
        /// Control List Filled
        CLF OFFSET(1) NUMBITS(1) [],
        /// Bulk List Filled
        BLF OFFSET(2) NUMBITS(1) [],
        /// Ownership Change Request
        OCR OFFSET(3) NUMBITS(1) [],
        /// Scheduling Overrun Count
        SOC OFFSET(16) NUMBITS(2) []
    ],

    /// HcInterruptStatus / HcInterruptEnable / HcInterruptDisable
    pub HC_INTERRUPT [
        /// Scheduling Overrun
        SO OFFSET(0) NUMBITS(1) [],
        /// Writeback Done Head
        WDH OFFSET(1) NUMBITS(1) [],
        /// Start of Frame
        SF OFFSET(2) NUMBITS(1) [],
        /// Resume Detected
        RD OFFSET(3) NUMBITS(1) [],
        /// Unrecoverable Error
        UE OFFSET(4) NUMBITS(1) [],
        /// Frame Number Overflow
        FNO OFFSET(5) NUMBITS(1) [],
        /// Root Hub Status Change
        RHSC OFFSET(6) NUMBITS(1) [],
        /// Ownership Change
        OC OFFSET(30) NUMBITS(1) [],
        /// Master Interrupt Enable
        MIE OFFSET(31) NUMBITS(1) []
    ]
];

// ============================================================================
// Frame Counter Partition
// ============================================================================

register_bitfields! [
    u32,
    /// HcFmInterval - offset 0x34
    pub HC_FM_INTERVAL [
        /// Frame Interval (bit times)
        FI OFFSET(0) NUMBITS(14) [],
        /// FS Largest Data Packet
        FSMPS OFFSET(16) NUMBITS(15) [],
        /// Frame Interval Toggle
        FIT OFFSET(31) NUMBITS(1) []
    ],

    /// HcFmNumber - offset 0x3C
    pub HC_FM_NUMBER [
        /// Frame Number
        FN OFFSET(0) NUMBITS(16) []
    ],

    /// HcPeriodicStart - offset 0x40
    pub HC_PERIODIC_START [
        /// Periodic Start
        PS OFFSET(0) NUMBITS(14) []
    ]
];

// ============================================================================
// OHCI Operational Registers Memory Map
// ============================================================================

/// OHCI Operational Registers (up to the root hub partition)
#[repr(C)]
pub struct OhciOpRegs {
    /// HcRevision
    pub revision: ReadOnly<u32, HC_REVISION::Register>,
    /// HcControl
    pub control: ReadWrite<u32, HC_CONTROL::Register>,
    /// HcCommandStatus
    pub command_status: ReadWrite<u32, HC_COMMAND_STATUS::Register>,
    /// HcInterruptStatus (write 1 to clear)
    pub interrupt_status: ReadWrite<u32, HC_INTERRUPT::Register>,
    /// HcInterruptEnable (write 1 to set)
    pub interrupt_enable: ReadWrite<u32, HC_INTERRUPT::Register>,
    /// HcInterruptDisable (write 1 to clear enable)
    pub interrupt_disable: ReadWrite<u32, HC_INTERRUPT::Register>,
    /// HcHCCA
    pub hcca: ReadWrite<u32>,
    /// HcPeriodCurrentED
    pub period_current_ed: ReadOnly<u32>,
    /// HcControlHeadED
    pub control_head_ed: ReadWrite<u32>,
    /// HcControlCurrentED
    pub control_current_ed: ReadWrite<u32>,
    /// HcBulkHeadED
    pub bulk_head_ed: ReadWrite<u32>,
    /// HcBulkCurrentED
    pub bulk_current_ed: ReadWrite<u32>,
    /// HcDoneHead
    pub done_head: ReadOnly<u32>,
    /// HcFmInterval
    pub fm_interval: ReadWrite<u32, HC_FM_INTERVAL::Register>,
    /// HcFmRemaining
    pub fm_remaining: ReadOnly<u32>,
    /// HcFmNumber
    pub fm_number: ReadOnly<u32, HC_FM_NUMBER::Register>,
    /// HcPeriodicStart
    pub periodic_start: ReadWrite<u32, HC_PERIODIC_START::Register>,
    /// HcLSThreshold
    pub ls_threshold: ReadWrite<u32>,
}

// ============================================================================
// Register Bit Constants
// ============================================================================

/// HcControl bits
pub mod control {
    /// Periodic List Enable
    pub const PLE: u32 = 1 << 2;
    /// Isochronous Enable
    pub const IE: u32 = 1 << 3;
    /// Control List Enable
    pub const CLE: u32 = 1 << 4;
    /// Bulk List Enable
    pub const BLE: u32 = 1 << 5;
    /// Functional state mask
    pub const HCFS_MASK: u32 = 3 << 6;
    pub const HCFS_RESET: u32 = 0 << 6;
    pub const HCFS_OPERATIONAL: u32 = 2 << 6;
    /// Every list enabled
    pub const ALL_LISTS: u32 = PLE | IE | CLE | BLE;
}

/// HcCommandStatus bits
pub mod command {
    /// Host Controller Reset
    pub const HCR: u32 = 1 << 0;
    /// Control List Filled
    pub const CLF: u32 = 1 << 1;
    /// Bulk List Filled
    pub const BLF: u32 = 1 << 2;
}

/// HcInterrupt* bits
pub mod intr {
    /// Scheduling Overrun
    pub const SO: u32 = 1 << 0;
    /// Writeback Done Head
    pub const WDH: u32 = 1 << 1;
    /// Start of Frame
    pub const SF: u32 = 1 << 2;
    /// Resume Detected
    pub const RD: u32 = 1 << 3;
    /// Unrecoverable Error
    pub const UE: u32 = 1 << 4;
    /// Frame Number Overflow
    pub const FNO: u32 = 1 << 5;
    /// Root Hub Status Change
    pub const RHSC: u32 = 1 << 6;
    /// Ownership Change
    pub const OC: u32 = 1 << 30;
    /// Master Interrupt Enable
    pub const MIE: u32 = 1 << 31;
    /// Sources the driver services
    pub const NORMAL: u32 = SO | WDH | RD | UE | RHSC;
    /// Every source bit
    pub const ALL: u32 = SO | WDH | SF | RD | UE | FNO | RHSC | OC;
}

/// Low bit of HCCA done head: other interrupt sources are pending too
pub const DONE_INTRS: u32 = 1;

// ============================================================================
// Register access seam
// ============================================================================

/// Operational registers used by the transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OhciReg {
    Revision,
    Control,
    CommandStatus,
    InterruptStatus,
    InterruptEnable,
    InterruptDisable,
    Hcca,
    ControlHeadEd,
    BulkHeadEd,
    DoneHead,
    FmInterval,
    FmNumber,
    PeriodicStart,
}

impl OhciReg {
    /// Byte offset from the register base
    pub const fn offset(self) -> u32 {
        match self {
            OhciReg::Revision => 0x00,
            OhciReg::Control => 0x04,
            OhciReg::CommandStatus => 0x08,
            OhciReg::InterruptStatus => 0x0C,
            OhciReg::InterruptEnable => 0x10,
            OhciReg::InterruptDisable => 0x14,
            OhciReg::Hcca => 0x18,
            OhciReg::ControlHeadEd => 0x20,
            OhciReg::BulkHeadEd => 0x28,
            OhciReg::DoneHead => 0x30,
            OhciReg::FmInterval => 0x34,
            OhciReg::FmNumber => 0x3C,
            OhciReg::PeriodicStart => 0x40,
        }
    }
}

/// Register access primitive
///
/// Implementations must perform each access as a single ordered 32-bit
/// transaction.
pub trait RegisterAccess {
    fn read_reg(&self, reg: OhciReg) -> u32;
    fn write_reg(&self, reg: OhciReg, value: u32);
}

/// Memory-mapped OHCI register block
pub struct MmioRegisters {
    regs: NonNull<OhciOpRegs>,
}

// SAFETY: the register block belongs to exactly one controller and every
// access is a single volatile 32-bit operation.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wrap the register block mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the mapped OHCI operational register base and stay
    /// mapped for the lifetime of this value.
    pub unsafe fn new(base: u64) -> Option<Self> {
        let regs = NonNull::new(base as *mut OhciOpRegs)?;
        Some(Self { regs })
    }

    #[inline]
    fn regs(&self) -> &OhciOpRegs {
        // SAFETY: validity guaranteed by the constructor contract
        unsafe { self.regs.as_ref() }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read_reg(&self, reg: OhciReg) -> u32 {
        let r = self.regs();
        match reg {
            OhciReg::Revision => r.revision.get(),
            OhciReg::Control => r.control.get(),
            OhciReg::CommandStatus => r.command_status.get(),
            OhciReg::InterruptStatus => r.interrupt_status.get(),
            OhciReg::InterruptEnable => r.interrupt_enable.get(),
            OhciReg::InterruptDisable => r.interrupt_disable.get(),
            OhciReg::Hcca => r.hcca.get(),
            OhciReg::ControlHeadEd => r.control_head_ed.get(),
            OhciReg::BulkHeadEd => r.bulk_head_ed.get(),
            OhciReg::DoneHead => r.done_head.get(),
            OhciReg::FmInterval => r.fm_interval.get(),
            OhciReg::FmNumber => r.fm_number.get(),
            OhciReg::PeriodicStart => r.periodic_start.get(),
        }
    }

    fn write_reg(&self, reg: OhciReg, value: u32) {
        let r = self.regs();
        match reg {
            OhciReg::Control => r.control.set(value),
            OhciReg::CommandStatus => r.command_status.set(value),
            OhciReg::InterruptStatus => r.interrupt_status.set(value),
            OhciReg::InterruptEnable => r.interrupt_enable.set(value),
            OhciReg::InterruptDisable => r.interrupt_disable.set(value),
            OhciReg::Hcca => r.hcca.set(value),
            OhciReg::ControlHeadEd => r.control_head_ed.set(value),
            OhciReg::BulkHeadEd => r.bulk_head_ed.set(value),
            OhciReg::FmInterval => r.fm_interval.set(value),
            OhciReg::PeriodicStart => r.periodic_start.set(value),
            OhciReg::Revision | OhciReg::DoneHead | OhciReg::FmNumber => {
                log::warn!("OHCI: write to read-only register {:?}", reg);
            }
        }
    }
}
