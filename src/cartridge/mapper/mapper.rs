//! Mapper trait: cartridge-side address translation.

use crate::cartridge::mapper::Mirroring;

/// Translates CPU/PPU bus addresses into PRG/CHR offsets. `Some(offset)` means
/// the mapper claims the access and the cartridge serves it from its PRG or CHR
/// array; `None` lets the transaction fall through to the rest of the bus.
///
/// Bank-switching mappers intercept CPU writes to ROM ranges to update their
/// bank registers; such writes still return `None` so the ROM itself is never
/// written.
pub trait Mapper {
    /// Map a CPU read ($0000–$FFFF) to a PRG offset.
    fn cpu_map_read(&mut self, addr: u16) -> Option<u32>;
    /// Map a CPU write to a PRG offset, or absorb it into bank registers.
    fn cpu_map_write(&mut self, addr: u16, data: u8) -> Option<u32>;
    /// Map a PPU read ($0000–$3FFF) to a CHR offset.
    fn ppu_map_read(&self, addr: u16) -> Option<u32>;
    /// Map a PPU write to a CHR offset (only when CHR is RAM-backed).
    fn ppu_map_write(&self, addr: u16) -> Option<u32>;

    /// Current nametable mirroring; `Hardware` defers to the cartridge header.
    fn mirror(&self) -> Mirroring {
        Mirroring::Hardware
    }

    /// Restore power-on bank state. ROM contents are untouched.
    fn reset(&mut self) {}
}
