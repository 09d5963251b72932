//! Famira: a cycle-accurate NES (Nintendo Entertainment System) emulator.
//!
//! Emulates the NTSC NES chipset as documented on the
//! [NESdev Wiki](https://www.nesdev.org/wiki/NES_reference_guide): the Ricoh 2A03
//! (6502 CPU core + APU), the 2C02 PPU, the system bus with OAM DMA and controller
//! ports, and iNES cartridges with NROM/UxROM mappers.
//!
//! The bus is the composition root: [`bus::NesBus`] owns the CPU, PPU, APU and
//! cartridge, and `NesBus::clock()` advances the whole machine by one PPU dot.
//! Devices never hold a bus reference; the CPU reads and writes memory through the
//! [`bus::Bus`] trait, which the bus materializes over its own fields for the
//! duration of each clock call.
//!
//! ## Modules (NESdev references)
//!
//! - **apu** – [APU](https://www.nesdev.org/wiki/APU): pulse×2, triangle, noise, DMC,
//!   [frame counter](https://www.nesdev.org/wiki/APU_Frame_Counter), non-linear
//!   [mixer](https://www.nesdev.org/wiki/APU_Mixer)
//! - **bus** – [CPU memory map](https://www.nesdev.org/wiki/CPU_memory_map): WRAM, PPU
//!   registers, APU, [OAM DMA](https://www.nesdev.org/wiki/DMA), controllers; master
//!   clock fan-out (3 PPU dots per CPU cycle)
//! - **cartridge** – [iNES](https://www.nesdev.org/wiki/INES) loading;
//!   [mappers](https://www.nesdev.org/wiki/Mapper) NROM (0) and UxROM (2)
//! - **controller** – [Controller reading](https://www.nesdev.org/wiki/Controller_reading):
//!   $4016 latch, MSB-first shift-out
//! - **cpu** – [6502](https://www.nesdev.org/wiki/CPU): 256-entry instruction table,
//!   documented opcodes, cycle-accurate including page-cross penalties
//! - **ppu** – [PPU](https://www.nesdev.org/wiki/PPU): dot-accurate background/sprite
//!   pipelines, loopy scroll registers, sprite-zero hit, 4-slot frame ring

pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod ppu;
