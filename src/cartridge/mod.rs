//! NES cartridge loading and mapper support.
//!
//! - **cartridge**: Loads iNES (.nes) files, owns PRG/CHR memory and the mapper.
//! - **mapper**: NROM (0) and UxROM (2) address translation and nametable mirroring.

pub mod cartridge;
pub mod mapper;
