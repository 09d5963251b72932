//! NES cartridge: iNES parsing, PRG/CHR ownership, mapper dispatch.
//!
//! Implements the [iNES](https://www.nesdev.org/wiki/INES) format: 16-byte header
//! (magic `NES\x1A`, PRG size in 16 KiB units, CHR size in 8 KiB units, flags 6–7
//! for mapper id and mirroring, optional 512-byte trainer), then PRG ROM, then CHR
//! ROM. Zero CHR banks means the board carries 8 KiB of CHR RAM instead.
//!
//! On the bus the cartridge "sees all": every CPU and PPU transaction is offered
//! to it first, and the mapper may claim the access or let it fall through to
//! WRAM/VRAM. That veto is what lets mappers remap arbitrary ranges.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;

use crate::cartridge::mapper::Mirroring;
use crate::cartridge::mapper::mapper::Mapper;
use crate::cartridge::mapper::mapper0::Mapper0;
use crate::cartridge::mapper::mapper2::Mapper2;

/// Why a ROM image could not be turned into a cartridge. The bus keeps its
/// previous cartridge (or none) when loading fails.
#[derive(Debug)]
pub enum CartridgeError {
    Io(io::Error),
    /// File does not start with `NES\x1A`.
    BadMagic,
    /// File ends before the PRG/CHR payload the header promises.
    Truncated,
    /// Header names a mapper this emulator does not implement.
    UnsupportedMapper(u8),
}

impl fmt::Display for CartridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CartridgeError::Io(e) => write!(f, "could not read ROM file: {e}"),
            CartridgeError::BadMagic => write!(f, "not an iNES file (bad magic)"),
            CartridgeError::Truncated => write!(f, "ROM file is shorter than its header claims"),
            CartridgeError::UnsupportedMapper(id) => write!(f, "unsupported mapper {id}"),
        }
    }
}

impl Error for CartridgeError {}

impl From<io::Error> for CartridgeError {
    fn from(e: io::Error) -> Self {
        CartridgeError::Io(e)
    }
}

/// The iNES header fields this emulator consumes.
struct Header {
    prg_rom_chunks: u8,
    chr_rom_chunks: u8,
    mapper1: u8,
    mapper2: u8,
}

/// Cartridge: PRG/CHR byte arrays plus the mapper that translates bus addresses
/// into offsets. The hardware mirroring bit from the header is used whenever the
/// mapper reports [`Mirroring::Hardware`].
pub struct Cartridge {
    prg: Vec<u8>,
    chr: Vec<u8>,
    // Send so the whole console can live behind the shared execution mutex.
    mapper: Box<dyn Mapper + Send>,
    mapper_id: u8,
    hw_mirror: Mirroring,
}

impl fmt::Debug for Cartridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cartridge")
            .field("prg_len", &self.prg.len())
            .field("chr_len", &self.chr.len())
            .field("mapper_id", &self.mapper_id)
            .field("hw_mirror", &self.hw_mirror)
            .finish()
    }
}

impl Cartridge {
    /// Load a cartridge from an iNES file on disk.
    pub fn load(path: &str) -> Result<Self, CartridgeError> {
        Self::from_ines_bytes(&fs::read(path)?)
    }

    /// Build a cartridge from an in-memory iNES image.
    pub fn from_ines_bytes(bytes: &[u8]) -> Result<Self, CartridgeError> {
        if bytes.len() < 16 {
            return Err(CartridgeError::Truncated);
        }
        if &bytes[0..4] != b"NES\x1A" {
            return Err(CartridgeError::BadMagic);
        }

        let header = Header {
            prg_rom_chunks: bytes[4],
            chr_rom_chunks: bytes[5],
            mapper1: bytes[6],
            mapper2: bytes[7],
        };

        // Skip the 512-byte trainer when flag 6 bit 2 is set.
        let mut offset = 16;
        if header.mapper1 & 0x04 != 0 {
            offset += 512;
        }

        let mapper_id = (header.mapper2 & 0xF0) | (header.mapper1 >> 4);
        let hw_mirror = if header.mapper1 & 0x01 != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };

        let prg_len = header.prg_rom_chunks as usize * 16 * 1024;
        if prg_len == 0 || bytes.len() < offset + prg_len {
            return Err(CartridgeError::Truncated);
        }
        let prg = bytes[offset..offset + prg_len].to_vec();
        offset += prg_len;

        let chr = if header.chr_rom_chunks == 0 {
            // No CHR ROM: the board provides 8 KiB of CHR RAM.
            vec![0; 8 * 1024]
        } else {
            let chr_len = header.chr_rom_chunks as usize * 8 * 1024;
            if bytes.len() < offset + chr_len {
                return Err(CartridgeError::Truncated);
            }
            bytes[offset..offset + chr_len].to_vec()
        };

        let mapper: Box<dyn Mapper + Send> = match mapper_id {
            0 => Box::new(Mapper0::new(header.prg_rom_chunks, header.chr_rom_chunks)),
            2 => Box::new(Mapper2::new(header.prg_rom_chunks, header.chr_rom_chunks)),
            id => return Err(CartridgeError::UnsupportedMapper(id)),
        };

        Ok(Self {
            prg,
            chr,
            mapper,
            mapper_id,
            hw_mirror,
        })
    }

    /// Offer a CPU read to the cartridge. `Some(data)` means it claimed the
    /// address; `None` lets the bus decode it elsewhere.
    pub fn cpu_read(&mut self, addr: u16) -> Option<u8> {
        self.mapper
            .cpu_map_read(addr)
            .map(|mapped| self.prg[mapped as usize])
    }

    /// Offer a CPU write to the cartridge. Returns true when claimed.
    pub fn cpu_write(&mut self, addr: u16, data: u8) -> bool {
        match self.mapper.cpu_map_write(addr, data) {
            Some(mapped) => {
                self.prg[mapped as usize] = data;
                true
            }
            None => false,
        }
    }

    /// Offer a PPU read (pattern-table space) to the cartridge.
    pub fn ppu_read(&self, addr: u16) -> Option<u8> {
        self.mapper
            .ppu_map_read(addr)
            .map(|mapped| self.chr[mapped as usize])
    }

    /// Offer a PPU write to the cartridge (CHR RAM boards only).
    pub fn ppu_write(&mut self, addr: u16, data: u8) -> bool {
        match self.mapper.ppu_map_write(addr) {
            Some(mapped) => {
                self.chr[mapped as usize] = data;
                true
            }
            None => false,
        }
    }

    /// Effective mirroring: the mapper's choice, or the header solder bit when
    /// the mapper defers to hardware.
    pub fn mirror(&self) -> Mirroring {
        match self.mapper.mirror() {
            Mirroring::Hardware => self.hw_mirror,
            m => m,
        }
    }

    /// Reset the mapper's bank registers. ROM contents are untouched.
    pub fn reset(&mut self) {
        self.mapper.reset();
    }

    pub fn mapper_id(&self) -> u8 {
        self.mapper_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal iNES image: header + PRG chunks + CHR chunks.
    fn ines(prg_chunks: u8, chr_chunks: u8, flags6: u8, flags7: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = prg_chunks;
        bytes[5] = chr_chunks;
        bytes[6] = flags6;
        bytes[7] = flags7;
        bytes.extend(std::iter::repeat(0).take(prg_chunks as usize * 16 * 1024));
        bytes.extend(std::iter::repeat(0).take(chr_chunks as usize * 8 * 1024));
        bytes
    }

    #[test]
    fn header_round_trip() {
        let cart = Cartridge::from_ines_bytes(&ines(1, 1, 0x01, 0x00)).unwrap();
        assert_eq!(cart.mapper_id(), 0);
        assert_eq!(cart.mirror(), Mirroring::Vertical);
    }

    #[test]
    fn mapper_id_from_both_nibbles() {
        // flags6 high nibble = low nibble of id, flags7 high nibble = high nibble.
        let err = Cartridge::from_ines_bytes(&ines(1, 1, 0x20, 0x10)).unwrap_err();
        match err {
            CartridgeError::UnsupportedMapper(id) => assert_eq!(id, 0x12),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = ines(1, 1, 0, 0);
        bytes[0] = b'X';
        assert!(matches!(
            Cartridge::from_ines_bytes(&bytes),
            Err(CartridgeError::BadMagic)
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut bytes = ines(2, 1, 0, 0);
        bytes.truncate(16 + 1024);
        assert!(matches!(
            Cartridge::from_ines_bytes(&bytes),
            Err(CartridgeError::Truncated)
        ));
    }

    #[test]
    fn nrom_single_bank_mirrors_prg() {
        let mut image = ines(1, 1, 0, 0);
        image[16 + 0x1000] = 0xAB; // PRG offset 0x1000
        let mut cart = Cartridge::from_ines_bytes(&image).unwrap();
        // $9000 and $D000 both land on PRG offset 0x1000 in a 16 KiB board.
        assert_eq!(cart.cpu_read(0x9000), Some(0xAB));
        assert_eq!(cart.cpu_read(0xD000), Some(0xAB));
    }

    #[test]
    fn nrom_double_bank_maps_flat() {
        let mut image = ines(2, 1, 0, 0);
        image[16 + 0x1000] = 0xAB; // low bank
        image[16 + 0x5000] = 0xCD; // high bank
        let mut cart = Cartridge::from_ines_bytes(&image).unwrap();
        assert_eq!(cart.cpu_read(0x9000), Some(0xAB));
        assert_eq!(cart.cpu_read(0xD000), Some(0xCD));
    }

    #[test]
    fn uxrom_bank_switch_and_fixed_high_bank() {
        // Mapper 2, 4 PRG banks, CHR RAM.
        let mut image = ines(4, 0, 0x20, 0x00);
        image[16] = 0x11; // bank 0, offset 0
        image[16 + 2 * 16 * 1024] = 0x22; // bank 2, offset 0
        image[16 + 3 * 16 * 1024] = 0x33; // bank 3 (last), offset 0
        let mut cart = Cartridge::from_ines_bytes(&image).unwrap();
        assert_eq!(cart.cpu_read(0x8000), Some(0x11));
        // High window always shows the last bank.
        assert_eq!(cart.cpu_read(0xC000), Some(0x33));
        // Select bank 2 in the low window; the write is absorbed, not stored.
        assert!(!cart.cpu_write(0x8000, 2));
        assert_eq!(cart.cpu_read(0x8000), Some(0x22));
        assert_eq!(cart.cpu_read(0xC000), Some(0x33));
        // Reset restores bank 0.
        cart.reset();
        assert_eq!(cart.cpu_read(0x8000), Some(0x11));
    }

    #[test]
    fn chr_ram_when_no_chr_banks() {
        let mut cart = Cartridge::from_ines_bytes(&ines(1, 0, 0, 0)).unwrap();
        assert!(cart.ppu_write(0x0123, 0x5A));
        assert_eq!(cart.ppu_read(0x0123), Some(0x5A));
    }

    #[test]
    fn chr_rom_rejects_writes() {
        let mut cart = Cartridge::from_ines_bytes(&ines(1, 1, 0, 0)).unwrap();
        assert!(!cart.ppu_write(0x0123, 0x5A));
        assert_eq!(cart.ppu_read(0x0123), Some(0x00));
    }
}
