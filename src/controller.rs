//! NES controller button layout.
//!
//! The standard controller is fully described by one byte per port, latched on
//! the bus by a write of 1 to $4016 and shifted out MSB-first on $4016/$4017
//! reads. See [Controller reading](https://www.nesdev.org/wiki/Controller_reading).
//! The input layer composes a mask from these bits and stores it in
//! `NesBus::controller`; the serial protocol itself lives on the bus.

pub const BUTTON_A: u8 = 0x80;
pub const BUTTON_B: u8 = 0x40;
pub const BUTTON_SELECT: u8 = 0x20;
pub const BUTTON_START: u8 = 0x10;
pub const BUTTON_UP: u8 = 0x08;
pub const BUTTON_DOWN: u8 = 0x04;
pub const BUTTON_LEFT: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x01;
