//! Boot-protocol keyboard report decoding.
//!
//! Reports are 8 bytes: a modifier bitmap, a reserved byte and up to six
//! scan codes. A key press is edge-triggered: a code present now but absent
//! from the previous report. Held keys repeat on a timer with a 500 ms
//! initial delay and then every 33 ms, keyed on the most recently pressed
//! code.

use bitflags::bitflags;

/// Cursor and editing keys, surfaced above the ASCII range.
pub const KEY_UP: u8 = 0x80;
pub const KEY_DOWN: u8 = 0x81;
pub const KEY_LEFT: u8 = 0x82;
pub const KEY_RIGHT: u8 = 0x83;
pub const KEY_HOME: u8 = 0x84;
pub const KEY_END: u8 = 0x85;
pub const KEY_DELETE: u8 = 0x86;
pub const KEY_SHIFT_LEFT: u8 = 0x90;
pub const KEY_SHIFT_RIGHT: u8 = 0x91;

/// Ticks before a held key starts repeating.
const REPEAT_DELAY_TICKS: u64 = 500;
/// Ticks between repeats once started (about 30 chars/second).
const REPEAT_RATE_TICKS: u64 = 33;

bitflags! {
    /// Byte 0 of a boot keyboard report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const LEFT_CTRL = 0x01;
        const LEFT_SHIFT = 0x02;
        const LEFT_ALT = 0x04;
        const LEFT_GUI = 0x08;
        const RIGHT_CTRL = 0x10;
        const RIGHT_SHIFT = 0x20;
        const RIGHT_ALT = 0x40;
        const RIGHT_GUI = 0x80;
    }
}

impl Modifiers {
    pub fn shift(self) -> bool {
        self.intersects(Modifiers::LEFT_SHIFT | Modifiers::RIGHT_SHIFT)
    }

    pub fn ctrl(self) -> bool {
        self.intersects(Modifiers::LEFT_CTRL | Modifiers::RIGHT_CTRL)
    }
}

/// HID usage code to character, US layout, unshifted. Arrow/home/end/delete
/// map to the 0x80-range codes above.
#[rustfmt::skip]
static KEYMAP: [u8; 128] = [
    0,    0,    0,    0,    b'a', b'b', b'c', b'd', // 0x00
    b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', // 0x08
    b'm', b'n', b'o', b'p', b'q', b'r', b's', b't', // 0x10
    b'u', b'v', b'w', b'x', b'y', b'z', b'1', b'2', // 0x18
    b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', // 0x20
    b'\n', 27,  8,    b'\t', b' ', b'-', b'=', b'[', // 0x28
    b']', b'\\', b'#', b';', b'\'', b'`', b',', b'.', // 0x30
    b'/', 0,    0,    0,    0,    0,    0,    0,    // 0x38: CapsLock, F1-F6
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x40: F7-F12, PrtSc, ScrLk
    0,    0,    KEY_HOME, 0, KEY_DELETE, KEY_END, 0, KEY_RIGHT, // 0x48
    KEY_LEFT, KEY_DOWN, KEY_UP, 0, b'/', b'*', b'-', b'+', // 0x50
    b'\n', b'1', b'2', b'3', b'4', b'5', b'6', b'7', // 0x58: keypad
    b'8', b'9', b'0', b'.', 0,    0,    0,    b'=', // 0x60
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x68
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x70
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x78
];

/// Shifted variants of [`KEYMAP`].
#[rustfmt::skip]
static KEYMAP_SHIFT: [u8; 128] = [
    0,    0,    0,    0,    b'A', b'B', b'C', b'D', // 0x00
    b'E', b'F', b'G', b'H', b'I', b'J', b'K', b'L', // 0x08
    b'M', b'N', b'O', b'P', b'Q', b'R', b'S', b'T', // 0x10
    b'U', b'V', b'W', b'X', b'Y', b'Z', b'!', b'@', // 0x18
    b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', // 0x20
    b'\n', 27,  8,    b'\t', b' ', b'_', b'+', b'{', // 0x28
    b'}', b'|', b'~', b':', b'"', b'~', b'<', b'>', // 0x30
    b'?', 0,    0,    0,    0,    0,    0,    0,    // 0x38
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x40
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x48
    0,    0,    0,    0,    b'/', b'*', b'-', b'+', // 0x50
    b'\n', b'1', b'2', b'3', b'4', b'5', b'6', b'7', // 0x58
    b'8', b'9', b'0', b'.', 0,    0,    0,    b'=', // 0x60
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x68
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x70
    0,    0,    0,    0,    0,    0,    0,    0,    // 0x78
];

fn translate(code: u8, shift: bool) -> u8 {
    if shift {
        KEYMAP_SHIFT[code as usize]
    } else {
        KEYMAP[code as usize]
    }
}

/// Decoder state for one boot keyboard.
pub struct BootKeyboard {
    last_report: [u8; 8],
    repeat_code: u8,
    repeat_shift: bool,
    repeat_ctrl: bool,
    repeat_start_tick: u64,
    repeat_last_tick: u64,
}

impl BootKeyboard {
    pub const fn new() -> Self {
        Self {
            last_report: [0; 8],
            repeat_code: 0,
            repeat_shift: false,
            repeat_ctrl: false,
            repeat_start_tick: 0,
            repeat_last_tick: 0,
        }
    }

    fn was_pressed(&self, code: u8) -> bool {
        self.last_report[2..8].contains(&code)
    }

    fn arm_repeat(&mut self, code: u8, shift: bool, ctrl: bool, now: u64) {
        self.repeat_code = code;
        self.repeat_shift = shift;
        self.repeat_ctrl = ctrl;
        self.repeat_start_tick = now;
        self.repeat_last_tick = now;
    }

    fn emit(code: u8, shift: bool, ctrl: bool, out: &mut dyn FnMut(u8)) {
        let c = translate(code, shift);
        if c == 0 {
            return;
        }
        if ctrl {
            // Letters become the matching C0 control byte; a few punctuation
            // keys carry the remaining C0 codes.
            match c {
                b'a'..=b'z' => return out(c - b'a' + 1),
                b'A'..=b'Z' => return out(c - b'A' + 1),
                b'[' | b'{' => return out(27),
                b'\\' | b'|' => return out(28),
                b']' | b'}' => return out(29),
                _ => {}
            }
        }
        out(c);
    }

    /// Decode one 8-byte report, pushing translated characters through
    /// `out`. `now` anchors the repeat timer.
    pub fn process_report(&mut self, report: &[u8; 8], now: u64, out: &mut dyn FnMut(u8)) {
        let modifiers = Modifiers::from_bits_truncate(report[0]);
        let shift = modifiers.shift();
        let ctrl = modifiers.ctrl();

        for &code in &report[2..8] {
            if code == 0 || code >= 128 {
                continue;
            }
            if self.was_pressed(code) {
                continue;
            }

            // Shift+arrow selection codes take precedence over translation.
            if shift && code == 0x50 {
                out(KEY_SHIFT_LEFT);
                self.arm_repeat(code, shift, ctrl, now);
                continue;
            }
            if shift && code == 0x4f {
                out(KEY_SHIFT_RIGHT);
                self.arm_repeat(code, shift, ctrl, now);
                continue;
            }

            Self::emit(code, shift, ctrl, out);
            self.arm_repeat(code, shift, ctrl, now);
        }

        // All keys up stops the repeat.
        if report[2..8].iter().all(|&c| c == 0 || c >= 128) {
            self.repeat_code = 0;
        }

        self.last_report = *report;
    }

    /// Fire pending repeats. Called on every poll, independent of new
    /// reports.
    pub fn handle_repeat(&mut self, now: u64, out: &mut dyn FnMut(u8)) {
        if self.repeat_code == 0 {
            return;
        }
        if now - self.repeat_start_tick < REPEAT_DELAY_TICKS {
            return;
        }
        if now - self.repeat_last_tick < REPEAT_RATE_TICKS {
            return;
        }
        Self::emit(self.repeat_code, self.repeat_shift, self.repeat_ctrl, out);
        self.repeat_last_tick = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(kb: &mut BootKeyboard, report: [u8; 8], now: u64) -> Vec<u8> {
        let mut chars = Vec::new();
        kb.process_report(&report, now, &mut |c| chars.push(c));
        chars
    }

    #[test]
    fn presses_are_edge_triggered() {
        let mut kb = BootKeyboard::new();
        // 'a' held from the previous report, 'b' newly pressed.
        assert_eq!(collect(&mut kb, [0, 0, 0x04, 0, 0, 0, 0, 0], 0), b"a");
        assert_eq!(collect(&mut kb, [0, 0, 0x04, 0x05, 0, 0, 0, 0], 10), b"b");
        // Same report again: nothing new.
        assert_eq!(collect(&mut kb, [0, 0, 0x04, 0x05, 0, 0, 0, 0], 20), b"");
    }

    #[test]
    fn shift_produces_uppercase_and_symbols() {
        let mut kb = BootKeyboard::new();
        assert_eq!(collect(&mut kb, [0x02, 0, 0x04, 0, 0, 0, 0, 0], 0), b"A");
        let mut kb = BootKeyboard::new();
        // Right shift + '1' -> '!'
        assert_eq!(collect(&mut kb, [0x20, 0, 0x1e, 0, 0, 0, 0, 0], 0), b"!");
    }

    #[test]
    fn ctrl_letters_become_control_bytes() {
        let mut kb = BootKeyboard::new();
        // Ctrl+C -> ETX (3).
        assert_eq!(collect(&mut kb, [0x01, 0, 0x06, 0, 0, 0, 0, 0], 0), &[3]);
        let mut kb = BootKeyboard::new();
        // Right ctrl + shift + 'a' still yields SOH (1).
        assert_eq!(collect(&mut kb, [0x12, 0, 0x04, 0, 0, 0, 0, 0], 0), &[1]);
    }

    #[test]
    fn arrows_and_editing_keys_use_high_codes() {
        let mut kb = BootKeyboard::new();
        assert_eq!(
            collect(&mut kb, [0, 0, 0x52, 0x51, 0x50, 0x4f, 0, 0], 0),
            &[KEY_UP, KEY_DOWN, KEY_LEFT, KEY_RIGHT]
        );
        let mut kb = BootKeyboard::new();
        assert_eq!(
            collect(&mut kb, [0, 0, 0x4a, 0x4d, 0x4c, 0, 0, 0], 0),
            &[KEY_HOME, KEY_END, KEY_DELETE]
        );
    }

    #[test]
    fn shifted_arrows_become_selection_codes() {
        let mut kb = BootKeyboard::new();
        assert_eq!(
            collect(&mut kb, [0x02, 0, 0x50, 0, 0, 0, 0, 0], 0),
            &[KEY_SHIFT_LEFT]
        );
        assert_eq!(
            collect(&mut kb, [0x02, 0, 0x50, 0x4f, 0, 0, 0, 0], 5),
            &[KEY_SHIFT_RIGHT]
        );
    }

    #[test]
    fn held_key_repeats_after_the_delay_then_at_the_cadence() {
        let mut kb = BootKeyboard::new();
        let report = [0u8, 0, 0x05, 0, 0, 0, 0, 0];
        assert_eq!(collect(&mut kb, report, 1000), b"b");

        let mut repeats = Vec::new();
        // Before the 500-tick delay: silence.
        kb.handle_repeat(1400, &mut |c| repeats.push(c));
        assert!(repeats.is_empty());

        // Delay elapsed: first repeat fires.
        kb.handle_repeat(1500, &mut |c| repeats.push(c));
        assert_eq!(repeats, b"b");

        // Cadence not yet reached.
        kb.handle_repeat(1520, &mut |c| repeats.push(c));
        assert_eq!(repeats, b"b");

        // 33 ticks after the last repeat.
        kb.handle_repeat(1533, &mut |c| repeats.push(c));
        assert_eq!(repeats, b"bb");
    }

    #[test]
    fn releasing_all_keys_stops_the_repeat() {
        let mut kb = BootKeyboard::new();
        collect(&mut kb, [0, 0, 0x05, 0, 0, 0, 0, 0], 0);
        collect(&mut kb, [0, 0, 0, 0, 0, 0, 0, 0], 100);

        let mut repeats = Vec::new();
        kb.handle_repeat(10_000, &mut |c| repeats.push(c));
        assert!(repeats.is_empty());
    }

    #[test]
    fn unknown_codes_produce_nothing() {
        let mut kb = BootKeyboard::new();
        // F1 (0x3a) and an out-of-table code.
        assert_eq!(collect(&mut kb, [0, 0, 0x3a, 0x7f, 0, 0, 0, 0], 0), b"");
    }
}
