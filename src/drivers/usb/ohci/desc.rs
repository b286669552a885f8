//! OHCI hardware descriptor layouts
//!
//! Endpoint, transfer and isochronous transfer descriptors plus the Host
//! Controller Communications Area. These are the exact little-endian layouts
//! the controller reads and writes through DMA.
//!
//! # References
//! - OpenHCI Specification 1.0a, chapter 4

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// OHCI page size for buffer pointer arithmetic
pub const PAGE_SIZE: u32 = 4096;

/// Page base of a physical address
#[inline]
pub const fn page(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of a physical address inside its page
#[inline]
pub const fn page_offset(addr: u32) -> u32 {
    addr & (PAGE_SIZE - 1)
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// Endpoint Descriptor (16 bytes, 16-byte aligned)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HwEd {
    pub flags: u32,
    pub tailp: u32,
    pub headp: u32,
    pub nexted: u32,
}

pub const ED_FLAGS: usize = core::mem::offset_of!(HwEd, flags);
pub const ED_TAILP: usize = core::mem::offset_of!(HwEd, tailp);
pub const ED_HEADP: usize = core::mem::offset_of!(HwEd, headp);
pub const ED_NEXTED: usize = core::mem::offset_of!(HwEd, nexted);

/// ED flags dword
pub mod ed {
    /// Function address shift
    pub const FA_SHIFT: u32 = 0;
    pub const FA_MASK: u32 = 0x7F;
    /// Endpoint number shift
    pub const EN_SHIFT: u32 = 7;
    pub const EN_MASK: u32 = 0xF << 7;
    /// Direction taken from each TD
    pub const DIR_TD: u32 = 0 << 11;
    pub const DIR_OUT: u32 = 1 << 11;
    pub const DIR_IN: u32 = 2 << 11;
    pub const DIR_MASK: u32 = 3 << 11;
    /// Low speed device
    pub const SPEED: u32 = 1 << 13;
    /// Controller skips this ED
    pub const SKIP: u32 = 1 << 14;
    /// ED carries isochronous TDs
    pub const FORMAT_ISO: u32 = 1 << 15;
    /// Maximum packet size shift
    pub const MAXP_SHIFT: u32 = 16;
    pub const MAXP_MASK: u32 = 0x7FF << 16;

    /// Halted (headp bit 0)
    pub const HALTED: u32 = 1 << 0;
    /// Toggle carry (headp bit 1)
    pub const TOGGLECARRY: u32 = 1 << 1;
    /// Address bits of headp/tailp
    pub const HEADMASK: u32 = !0xF;

    #[inline]
    pub const fn set_fa(addr: u8) -> u32 {
        (addr as u32 & FA_MASK) << FA_SHIFT
    }

    #[inline]
    pub const fn set_en(ep: u8) -> u32 {
        ((ep as u32) << EN_SHIFT) & EN_MASK
    }

    #[inline]
    pub const fn set_maxp(mps: u16) -> u32 {
        ((mps as u32) << MAXP_SHIFT) & MAXP_MASK
    }

    #[inline]
    pub const fn get_maxp(flags: u32) -> u32 {
        (flags & MAXP_MASK) >> MAXP_SHIFT
    }
}

// ============================================================================
// General Transfer Descriptor
// ============================================================================

/// General Transfer Descriptor (16 bytes, 16-byte aligned)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HwTd {
    pub flags: u32,
    /// Current buffer pointer (0 once the whole buffer moved)
    pub cbp: u32,
    pub nexttd: u32,
    /// Address of the last buffer byte
    pub be: u32,
}

pub const TD_FLAGS: usize = core::mem::offset_of!(HwTd, flags);
pub const TD_CBP: usize = core::mem::offset_of!(HwTd, cbp);
pub const TD_NEXTTD: usize = core::mem::offset_of!(HwTd, nexttd);
pub const TD_BE: usize = core::mem::offset_of!(HwTd, be);

/// TD flags dword
pub mod td {
    /// Buffer rounding (short packet is not an error)
    pub const R: u32 = 1 << 18;
    pub const DP_SETUP: u32 = 0 << 19;
    pub const DP_OUT: u32 = 1 << 19;
    pub const DP_IN: u32 = 2 << 19;
    pub const DP_MASK: u32 = 3 << 19;
    /// Delay interrupt shift
    pub const DI_SHIFT: u32 = 21;
    pub const DI_MASK: u32 = 7 << 21;
    /// No interrupt on retirement
    pub const NOINTR: u32 = 7 << 21;
    pub const TOGGLE_CARRY: u32 = 0 << 24;
    pub const TOGGLE_0: u32 = 2 << 24;
    pub const TOGGLE_1: u32 = 3 << 24;
    pub const TOGGLE_MASK: u32 = 3 << 24;
    /// Error count shift
    pub const EC_SHIFT: u32 = 26;
    /// Condition code shift
    pub const CC_SHIFT: u32 = 28;
    pub const CC_MASK: u32 = 0xF << 28;
    /// Condition code "not accessed", written before queueing
    pub const NOCC: u32 = 0xF << 28;

    #[inline]
    pub const fn set_di(frames: u32) -> u32 {
        (frames << DI_SHIFT) & DI_MASK
    }

    #[inline]
    pub const fn get_cc(flags: u32) -> u32 {
        (flags & CC_MASK) >> CC_SHIFT
    }
}

// ============================================================================
// Isochronous Transfer Descriptor
// ============================================================================

/// Maximum number of frames one ITD describes
pub const ITD_NOFFSET: usize = 8;

/// Largest full-speed isochronous packet
pub const ISO_MAX_PACKET: u32 = 1023;

/// Isochronous Transfer Descriptor (32 bytes, 32-byte aligned)
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct HwItd {
    pub flags: u32,
    /// Page of the first buffer byte
    pub bp0: u32,
    pub nextitd: u32,
    pub be: u32,
    /// Per-frame offsets, rewritten as packet status words on retirement
    pub offset: [u16; ITD_NOFFSET],
}

pub const ITD_FLAGS: usize = core::mem::offset_of!(HwItd, flags);
pub const ITD_NEXTITD: usize = core::mem::offset_of!(HwItd, nextitd);

/// ITD flags dword and packet status words
pub mod itd {
    /// Starting frame mask
    pub const SF_MASK: u32 = 0xFFFF;
    pub const DI_SHIFT: u32 = 21;
    pub const DI_MASK: u32 = 7 << 21;
    /// Frame count (minus one) shift
    pub const FC_SHIFT: u32 = 24;
    pub const FC_MASK: u32 = 7 << 24;
    pub const CC_SHIFT: u32 = 28;
    pub const CC_MASK: u32 = 0xF << 28;
    pub const NOCC: u32 = 0xF << 28;

    #[inline]
    pub const fn set_sf(frame: u32) -> u32 {
        frame & SF_MASK
    }

    #[inline]
    pub const fn set_di(frames: u32) -> u32 {
        (frames << DI_SHIFT) & DI_MASK
    }

    /// Encode a frame count of `n` (1..=8)
    #[inline]
    pub const fn set_fc(n: u32) -> u32 {
        (n.saturating_sub(1) << FC_SHIFT) & FC_MASK
    }

    #[inline]
    pub const fn get_fc(flags: u32) -> u32 {
        ((flags & FC_MASK) >> FC_SHIFT) + 1
    }

    #[inline]
    pub const fn get_cc(flags: u32) -> u32 {
        (flags & CC_MASK) >> CC_SHIFT
    }

    /// Offset word for a buffer offset, condition code "not accessed"
    #[inline]
    pub const fn mk_offs(offs: u32) -> u16 {
        (0xE000 | (offs & 0x1FFF)) as u16
    }

    /// Condition code of a packet status word
    #[inline]
    pub const fn psw_cc(psw: u16) -> u32 {
        (psw as u32 >> 12) & 0xF
    }

    /// Transferred size of a packet status word
    #[inline]
    pub const fn psw_len(psw: u16) -> u32 {
        psw as u32 & 0x7FF
    }
}

// ============================================================================
// Host Controller Communications Area
// ============================================================================

/// Number of interrupt table entries (1 ms leaves)
pub const NO_INTRS: usize = 32;

/// HCCA (256 bytes, 256-byte aligned)
#[repr(C, align(256))]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Hcca {
    pub interrupt_table: [u32; NO_INTRS],
    pub frame_number: u16,
    pub pad1: u16,
    pub done_head: u32,
    pub reserved: [u8; 120],
}

pub const HCCA_SIZE: usize = core::mem::size_of::<Hcca>();
pub const HCCA_ALIGN: usize = 256;
pub const HCCA_INTERRUPT_TABLE: usize = core::mem::offset_of!(Hcca, interrupt_table);
pub const HCCA_FRAME_NUMBER: usize = core::mem::offset_of!(Hcca, frame_number);
pub const HCCA_DONE_HEAD: usize = core::mem::offset_of!(Hcca, done_head);

// ============================================================================
// Condition codes
// ============================================================================

/// Completion code written back by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionCode {
    NoError,
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    /// The controller never touched the descriptor (0xE/0xF)
    NotAccessed,
    Reserved(u8),
}

pub mod cc {
    pub const NO_ERROR: u32 = 0;
    pub const STALL: u32 = 4;
    /// Both "not accessed" codes share these bits
    pub const NOT_ACCESSED_MASK: u32 = 0xE;
    pub const NOT_ACCESSED: u32 = 0xE;
}

impl ConditionCode {
    pub fn from_bits(code: u32) -> Self {
        match code & 0xF {
            0 => ConditionCode::NoError,
            1 => ConditionCode::Crc,
            2 => ConditionCode::BitStuffing,
            3 => ConditionCode::DataToggleMismatch,
            4 => ConditionCode::Stall,
            5 => ConditionCode::DeviceNotResponding,
            6 => ConditionCode::PidCheckFailure,
            7 => ConditionCode::UnexpectedPid,
            8 => ConditionCode::DataOverrun,
            9 => ConditionCode::DataUnderrun,
            12 => ConditionCode::BufferOverrun,
            13 => ConditionCode::BufferUnderrun,
            14 | 15 => ConditionCode::NotAccessed,
            other => ConditionCode::Reserved(other as u8),
        }
    }

    /// Errors on the wire (CRC, bit stuffing, toggle, PID) as opposed to
    /// device or host buffer problems
    pub fn is_transmission_error(self) -> bool {
        matches!(
            self,
            ConditionCode::Crc
                | ConditionCode::BitStuffing
                | ConditionCode::DataToggleMismatch
                | ConditionCode::PidCheckFailure
                | ConditionCode::UnexpectedPid
        )
    }
}
