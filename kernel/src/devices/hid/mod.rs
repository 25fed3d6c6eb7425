//! Polled USB-HID input.
//!
//! The main loop calls [`poll`] as a short non-blocking step. Each
//! configured device is polled at its own interval with one interrupt
//! transfer of up to 64 bytes; keyboard reports feed the character ring,
//! mouse reports update the shared pointer state. Nothing here suspends.

pub mod keyboard;
pub mod mouse;

use alloc::boxed::Box;

use log::{debug, info};
use spinning_top::Spinlock;
use spsc_ring::SpscRing;

use crate::devices::usb::{
    ControlRequest, DeviceInfo, HID_PROTOCOL_BOOT, HID_REQ_SET_IDLE, HID_REQ_SET_PROTOCOL,
    HostController, REQUEST_TYPE_CLASS_INTERFACE,
};
use crate::time;
use keyboard::BootKeyboard;
use mouse::{Mouse, MouseState};

/// Characters decoded but not yet consumed. Producer: the poll path.
/// Consumer: whoever reads stdin.
static KEYBOARD_RING: SpscRing<u8, 256> = SpscRing::new();

static HID: Spinlock<Option<HidCore>> = Spinlock::new(None);

/// Keyboards ask for periodic reports so a lost key-up recovers; 25 * 4 ms.
const KEYBOARD_IDLE_RATE: u16 = 25;

struct HidCore {
    controller: Box<dyn HostController>,
    keyboard: BootKeyboard,
    keyboard_present: bool,
    mouse: Mouse,
    mouse_present: bool,
    last_keyboard_poll: u64,
    last_mouse_poll: u64,
}

fn set_protocol(controller: &mut dyn HostController, device: &DeviceInfo, protocol: u16) -> bool {
    controller.control_transfer(
        device.slot_id,
        ControlRequest {
            request_type: REQUEST_TYPE_CLASS_INTERFACE,
            request: HID_REQ_SET_PROTOCOL,
            value: protocol,
            index: device.interface as u16,
        },
    )
}

fn set_idle(controller: &mut dyn HostController, slot_id: u8, interface: u8, rate: u16) -> bool {
    controller.control_transfer(
        slot_id,
        ControlRequest {
            request_type: REQUEST_TYPE_CLASS_INTERFACE,
            request: HID_REQ_SET_IDLE,
            value: rate << 8,
            index: interface as u16,
        },
    )
}

/// Adopt a host controller and configure every enumerated HID device.
///
/// Keyboards on a boot interface are switched to Boot Protocol and given a
/// slow idle rate. Mice keep their native report protocol (Boot Protocol
/// saturates fast mice at 8-bit deltas) and only get idle disabled.
pub fn init(mut controller: Box<dyn HostController>, screen_width: i32, screen_height: i32) {
    let mut keyboard_present = false;
    let mut mouse_present = false;

    for index in 0..controller.device_count() {
        let Some(device) = controller.device(index) else {
            continue;
        };
        if !device.configured {
            continue;
        }

        if device.is_keyboard {
            keyboard_present = true;
            if device.is_boot_interface && device.endpoint != 0 {
                if set_protocol(&mut *controller, &device, HID_PROTOCOL_BOOT) {
                    debug!("hid: slot {} keyboard in boot protocol", device.slot_id);
                }
            }
            if device.endpoint != 0 {
                set_idle(&mut *controller, device.slot_id, device.interface, KEYBOARD_IDLE_RATE);
            }
        }

        // Composite devices configure both halves.
        if device.is_mouse {
            mouse_present = true;
            let (endpoint, interface) = mouse_endpoint(&device);
            if endpoint != 0 {
                set_idle(&mut *controller, device.slot_id, interface, 0);
            }
        }
    }

    info!(
        "hid: keyboard={} mouse={}",
        keyboard_present, mouse_present
    );

    *HID.lock() = Some(HidCore {
        controller,
        keyboard: BootKeyboard::new(),
        keyboard_present,
        mouse: Mouse::new(screen_width, screen_height),
        mouse_present,
        last_keyboard_poll: 0,
        last_mouse_poll: 0,
    });
}

/// The interrupt endpoint and interface a device's mouse half reports on:
/// the second pair when present, the primary only for mouse-only devices.
fn mouse_endpoint(device: &DeviceInfo) -> (u8, u8) {
    if device.endpoint2 != 0 {
        (device.endpoint2, device.interface2)
    } else if !device.is_keyboard {
        (device.endpoint, device.interface)
    } else {
        (0, 0)
    }
}

/// Poll every HID device once. Called from the main loop.
pub fn poll() {
    let mut guard = HID.lock();
    let Some(core) = guard.as_mut() else {
        return;
    };

    let now = time::ticks();

    for index in 0..core.controller.device_count() {
        let Some(device) = core.controller.device(index) else {
            continue;
        };
        if !device.configured || device.slot_id == 0 {
            continue;
        }

        if device.is_keyboard && device.endpoint != 0 {
            let interval = device.poll_interval.max(1);
            if now.wrapping_sub(core.last_keyboard_poll) >= interval {
                let mut buffer = [0u8; 64];
                if let Some(transferred) =
                    core.controller
                        .interrupt_transfer(device.slot_id, device.endpoint, &mut buffer)
                {
                    // Boot keyboard reports are exactly 8 bytes.
                    if transferred == 8 {
                        let report: [u8; 8] = buffer[..8].try_into().unwrap();
                        core.keyboard
                            .process_report(&report, now, &mut |c| {
                                KEYBOARD_RING.push(c);
                            });
                    }
                }
                core.last_keyboard_poll = now;
            }
        }

        let (endpoint, _) = mouse_endpoint(&device);
        if device.is_mouse && endpoint != 0 {
            let interval = device.poll_interval.max(1);
            if now.wrapping_sub(core.last_mouse_poll) >= interval {
                let mut buffer = [0u8; 64];
                if let Some(transferred) =
                    core.controller
                        .interrupt_transfer(device.slot_id, endpoint, &mut buffer)
                {
                    if transferred >= 3 {
                        core.mouse.process_report(&buffer[..transferred]);
                    }
                }
                core.last_mouse_poll = now;
            }
        }
    }

    // Repeats run on every poll, independent of fresh reports.
    core.keyboard
        .handle_repeat(now, &mut |c| {
            KEYBOARD_RING.push(c);
        });
}

pub fn keyboard_available() -> bool {
    HID.lock().as_ref().is_some_and(|c| c.keyboard_present)
}

pub fn keyboard_has_char() -> bool {
    !KEYBOARD_RING.is_empty()
}

/// Pop the next decoded character, if any.
pub fn keyboard_get_char() -> Option<u8> {
    KEYBOARD_RING.pop()
}

/// A USB mouse counts as present only once it has produced a report; until
/// then the PS/2 fallback owns the pointer.
pub fn mouse_available() -> bool {
    HID.lock()
        .as_ref()
        .is_some_and(|c| c.mouse_present && c.mouse.has_received_data())
}

pub fn mouse_state() -> Option<MouseState> {
    HID.lock().as_ref().map(|c| c.mouse.state())
}

/// Drain the accumulated wheel delta.
pub fn mouse_take_scroll() -> i32 {
    HID.lock().as_mut().map_or(0, |c| c.mouse.take_scroll())
}

pub fn set_screen_size(width: i32, height: i32) {
    if let Some(core) = HID.lock().as_mut() {
        core.mouse.set_screen_size(width, height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A scripted controller: hands out queued reports per endpoint.
    struct MockController {
        devices: Vec<DeviceInfo>,
        reports: Mutex<Vec<(u8, Vec<u8>)>>,
        control_log: Arc<Mutex<Vec<ControlRequest>>>,
    }

    impl HostController for MockController {
        fn device_count(&self) -> usize {
            self.devices.len()
        }

        fn device(&self, index: usize) -> Option<DeviceInfo> {
            self.devices.get(index).copied()
        }

        fn interrupt_transfer(
            &mut self,
            _slot_id: u8,
            endpoint: u8,
            buffer: &mut [u8],
        ) -> Option<usize> {
            let mut reports = self.reports.lock().unwrap();
            let position = reports.iter().position(|(ep, _)| *ep == endpoint)?;
            let (_, report) = reports.remove(position);
            buffer[..report.len()].copy_from_slice(&report);
            Some(report.len())
        }

        fn control_transfer(&mut self, _slot_id: u8, request: ControlRequest) -> bool {
            self.control_log.lock().unwrap().push(request);
            true
        }
    }

    fn composite_device() -> DeviceInfo {
        DeviceInfo {
            slot_id: 1,
            configured: true,
            is_keyboard: true,
            is_mouse: true,
            is_boot_interface: true,
            interface: 0,
            endpoint: 1,
            interface2: 1,
            endpoint2: 2,
            poll_interval: 0,
        }
    }

    #[test]
    fn poll_decodes_keyboard_and_mouse_through_the_controller() {
        let control_log = Arc::new(Mutex::new(Vec::new()));
        let controller = MockController {
            devices: vec![composite_device()],
            reports: Mutex::new(vec![
                // Endpoint 1: boot keyboard report pressing 'x' (0x1b).
                (1, vec![0, 0, 0x1b, 0, 0, 0, 0, 0]),
                // Endpoint 2: mouse report, right button, dx=3 dy=2.
                (2, vec![2, 3, 2, 0]),
            ]),
            control_log: control_log.clone(),
        };

        init(Box::new(controller), 800, 600);
        assert!(keyboard_available());
        assert!(!mouse_available());

        // Init sent SET_PROTOCOL (boot) plus SET_IDLE for each half.
        {
            let log = control_log.lock().unwrap();
            assert!(
                log.iter()
                    .any(|r| r.request == HID_REQ_SET_PROTOCOL && r.value == HID_PROTOCOL_BOOT)
            );
            assert!(
                log.iter()
                    .any(|r| r.request == HID_REQ_SET_IDLE && r.value == 25 << 8 && r.index == 0)
            );
            // Mice only get idle disabled, never a protocol switch.
            assert!(
                log.iter()
                    .any(|r| r.request == HID_REQ_SET_IDLE && r.value == 0 && r.index == 1)
            );
            assert_eq!(
                log.iter().filter(|r| r.request == HID_REQ_SET_PROTOCOL).count(),
                1
            );
        }

        // Advance past the poll interval.
        crate::time::tick();
        crate::time::tick();

        poll();
        assert!(keyboard_has_char());
        assert_eq!(keyboard_get_char(), Some(b'x'));
        assert_eq!(keyboard_get_char(), None);

        // The mouse produced data, so the USB pointer now wins over PS/2.
        assert!(mouse_available());
        let state = mouse_state().unwrap();
        assert_eq!(state.x, 403);
        assert_eq!(state.y, 302);
        assert!(state.right);

        // Nothing queued: another poll adds nothing.
        poll();
        assert!(!keyboard_has_char());
    }
}
