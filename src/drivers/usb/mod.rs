//! USB host controller support
//!
//! Common types shared by the pipe layer and the host controller driver.
//! Only the OHCI transfer engine lives here; enumeration and class drivers
//! sit above it and talk to it through pipes and transfers.

pub mod ohci;

use crate::dma::DmaError;

// ============================================================================
// USB Speed
// ============================================================================

/// USB device speed (OHCI only drives low and full speed)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UsbSpeed {
    /// Low speed (1.5 Mbps)
    Low = 1,
    /// Full speed (12 Mbps)
    Full = 2,
}

impl UsbSpeed {
    pub fn from_ohci(is_low_speed: bool) -> Self {
        if is_low_speed {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }
}

// ============================================================================
// USB Endpoint Types
// ============================================================================

/// USB endpoint transfer type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    /// Control endpoint
    Control = 0,
    /// Isochronous endpoint
    Isochronous = 1,
    /// Bulk endpoint
    Bulk = 2,
    /// Interrupt endpoint
    Interrupt = 3,
}

impl EndpointType {
    /// Create from endpoint descriptor attributes field
    pub fn from_attributes(attr: u8) -> Self {
        match attr & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// USB transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
    /// Setup packet (control transfers)
    Setup,
}

/// Immutable attributes of one pipe, fixed when it is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointAttrs {
    /// Device address (0-127)
    pub device_address: u8,
    /// Endpoint number (0-15)
    pub endpoint: u8,
    /// Data direction; ignored for control endpoints
    pub direction: Direction,
    pub kind: EndpointType,
    /// wMaxPacketSize
    pub max_packet: u16,
    /// Polling interval in milliseconds (interrupt endpoints)
    pub interval_ms: u8,
    pub speed: UsbSpeed,
    /// Data toggle carried over from a previous pipe on this endpoint
    pub toggle: bool,
}

impl EndpointAttrs {
    /// Attributes from a raw endpoint descriptor
    pub fn from_descriptor(
        device_address: u8,
        speed: UsbSpeed,
        endpoint_address: u8,
        attributes: u8,
        max_packet: u16,
        interval: u8,
    ) -> Self {
        Self {
            device_address,
            endpoint: endpoint_address & 0x0F,
            direction: if endpoint_address & 0x80 != 0 {
                Direction::In
            } else {
                Direction::Out
            },
            kind: EndpointType::from_attributes(attributes),
            max_packet: max_packet & 0x7FF,
            interval_ms: interval,
            speed,
            toggle: false,
        }
    }

    /// Default control pipe of a device
    pub fn control(device_address: u8, speed: UsbSpeed, max_packet: u16) -> Self {
        Self {
            device_address,
            endpoint: 0,
            direction: Direction::Out,
            kind: EndpointType::Control,
            max_packet,
            interval_ms: 0,
            speed,
            toggle: false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// USB error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Controller not started or already shut down
    NotReady,
    /// Controller hit an unrecoverable error
    ControllerDead,
    /// Memory allocation failed; retrying later may succeed
    NoMemory,
    /// Invalid parameter
    InvalidParameter,
    /// Pipe handle is stale or closed
    NoSuchPipe,
    /// Pipe is being closed
    PipeClosing,
    /// Periodic schedule has no room for this request
    NoBandwidth,
    /// Operation timed out
    Timeout,
}

impl From<DmaError> for UsbError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::OutOfMemory => UsbError::NoMemory,
            DmaError::BadAlignment | DmaError::AddressTooHigh => UsbError::InvalidParameter,
        }
    }
}

impl core::fmt::Display for UsbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            UsbError::NotReady => "controller not ready",
            UsbError::ControllerDead => "controller halted",
            UsbError::NoMemory => "out of descriptor memory",
            UsbError::InvalidParameter => "invalid parameter",
            UsbError::NoSuchPipe => "no such pipe",
            UsbError::PipeClosing => "pipe is closing",
            UsbError::NoBandwidth => "no periodic bandwidth",
            UsbError::Timeout => "timed out",
        };
        f.write_str(msg)
    }
}
