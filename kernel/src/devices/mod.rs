//! Device collaborators.
//!
//! The kernel core drives devices through narrow contracts: a console sink
//! for syscall output, a USB host controller for HID transfers. The concrete
//! drivers (framebuffer terminal, xHCI) live outside the core and register
//! themselves here.

pub mod display;
pub mod hid;
pub mod usb;
