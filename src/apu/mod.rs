//! 2A03 APU (Audio Processing Unit) emulation.
//!
//! Five channels (pulse×2, triangle, noise, DMC), the 4/5-step frame sequencer,
//! and the non-linear output mixer. Clocked at CPU rate by the bus.

pub mod apu;
