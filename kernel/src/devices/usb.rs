//! The USB host-controller contract.
//!
//! The HID core needs exactly three things from the controller driver:
//! enumerate configured devices, run one interrupt transfer, run one control
//! transfer. Transfer mechanics (rings, TRBs, doorbells) stay behind this
//! trait.

/// What the HID layer knows about one enumerated device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfo {
    pub slot_id: u8,
    pub configured: bool,
    pub is_keyboard: bool,
    pub is_mouse: bool,
    /// The interface advertises the HID Boot subclass.
    pub is_boot_interface: bool,
    /// Primary HID interface and interrupt-IN endpoint.
    pub interface: u8,
    pub endpoint: u8,
    /// Second interface/endpoint pair on composite devices, 0 when absent.
    pub interface2: u8,
    pub endpoint2: u8,
    /// Polling interval in ticks, from the endpoint descriptor.
    pub poll_interval: u64,
}

/// A class-specific control request (SET_PROTOCOL, SET_IDLE, ...).
#[derive(Debug, Clone, Copy)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Host controller operations the HID core consumes.
pub trait HostController: Send {
    fn device_count(&self) -> usize;
    fn device(&self, index: usize) -> Option<DeviceInfo>;

    /// Submit one interrupt-IN transfer; returns the transferred length.
    fn interrupt_transfer(&mut self, slot_id: u8, endpoint: u8, buffer: &mut [u8])
    -> Option<usize>;

    /// Submit a control transfer with no data stage.
    fn control_transfer(&mut self, slot_id: u8, request: ControlRequest) -> bool;
}

/// Host-to-device, class, interface.
pub const REQUEST_TYPE_CLASS_INTERFACE: u8 = 0x21;
pub const HID_REQ_SET_IDLE: u8 = 0x0a;
pub const HID_REQ_SET_PROTOCOL: u8 = 0x0b;
pub const HID_PROTOCOL_BOOT: u16 = 0;
