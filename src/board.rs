//! Board services consumed by the bootloader core.

use std::sync::Arc;

/// Compile-time identity and layout of a board.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BoardInfo {
    /// Board type reported by `GET_DEVICE`.
    pub board_type: u32,
    /// Board revision reported by `GET_DEVICE`.
    pub board_rev: u32,
    /// Size of the flashable area in bytes.
    pub fw_size: u32,
    /// Core clock in MHz, used to derive the 1 ms tick.
    pub systick_mhz: u32,
    /// Physical address the application region is mapped at; the second
    /// word of a bootable image must point into
    /// `[app_load_address, app_load_address + fw_size)`.
    pub app_load_address: u32,
    /// App-region offset of the two-word boot-delay signature, if this
    /// board carries one.
    pub boot_delay_addr: Option<u32>,
}

/// The LEDs driven by the bootloader.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Led {
    /// Blinks while idle, solid during an erase.
    Bootloader = 0,
    /// Pulsed around every received command.
    Activity = 1,
}

/// Services the board layer provides to the bootloader.
pub trait Board {
    /// The board descriptor.
    fn info(&self) -> &BoardInfo;

    /// The MCU identity code (IDCODE).
    fn mcu_id(&self) -> u32;

    /// Writes the ASCII MCU description into `buf` and returns its length.
    fn mcu_desc(&self, buf: &mut [u8]) -> usize;

    /// Returns true when the silicon revision cannot be safely programmed.
    fn check_silicon(&self) -> bool;

    fn led_on(&self, led: Led);
    fn led_off(&self, led: Led);
    fn led_toggle(&self, led: Led);
}

// The tick source and the session run on different threads in the simulator,
// so boards are commonly shared behind an `Arc`.
impl<B: Board + ?Sized> Board for Arc<B> {
    fn info(&self) -> &BoardInfo {
        (**self).info()
    }

    fn mcu_id(&self) -> u32 {
        (**self).mcu_id()
    }

    fn mcu_desc(&self, buf: &mut [u8]) -> usize {
        (**self).mcu_desc(buf)
    }

    fn check_silicon(&self) -> bool {
        (**self).check_silicon()
    }

    fn led_on(&self, led: Led) {
        (**self).led_on(led)
    }

    fn led_off(&self, led: Led) {
        (**self).led_off(led)
    }

    fn led_toggle(&self, led: Led) {
        (**self).led_toggle(led)
    }
}
