//! System bus: address decoding, master clock fan-out, OAM DMA, controllers.
//!
//! [`NesBus`] is the composition root — it owns the CPU, PPU, APU, cartridge,
//! 2 KiB of work RAM, the controller latches and the DMA engine. Devices never
//! hold a reference back to the bus: the CPU performs memory access through the
//! [`Bus`] trait, which the bus implements over a short-lived borrow of its own
//! fields for the duration of each clock call, and the APU's DMC raises fetch
//! requests that the bus services between device ticks.
//!
//! Address decode gives the cartridge first refusal on every transaction (it
//! may map or veto any address), then falls through to WRAM ($0000–$1FFF,
//! mirrored every 2 KiB), the PPU registers ($2000–$3FFF, mirrored every 8
//! bytes), the APU ($4000–$4013, $4015, $4017 writes), the OAM DMA trigger
//! ($4014), and the controller ports ($4016/$4017 reads).

use crate::apu::apu::APU;
use crate::cartridge::cartridge::Cartridge;
use crate::cpu::cpu::CPU;
use crate::ppu::ppu::PPU;

/// Memory access seam between the CPU and everything else. Reads never fail:
/// unmapped ranges return 0, like the real bus floating low.
pub trait Bus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, data: u8);
}

/// OAM DMA engine state. Once armed via $4014, the bus alternates
/// read-from-CPU-space / write-to-OAM every CPU cycle for 256 bytes, after an
/// alignment dummy cycle; the CPU is suspended for the duration.
struct OamDma {
    page: u8,
    addr: u8,
    data: u8,
    dummy: bool,
    transfer: bool,
}

impl OamDma {
    fn new() -> Self {
        Self {
            page: 0,
            addr: 0,
            data: 0,
            dummy: true,
            transfer: false,
        }
    }
}

/// Borrow view over the bus fields a CPU memory access can touch. Built fresh
/// for each call that needs one and never stored.
struct CpuView<'a> {
    wram: &'a mut [u8; 2048],
    ppu: &'a mut PPU,
    apu: &'a mut APU,
    cart: &'a mut Option<Cartridge>,
    controller: &'a [u8; 2],
    controller_state: &'a mut [u8; 2],
    dma: &'a mut OamDma,
}

impl Bus for CpuView<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        // The cartridge sees every transaction first and may veto it.
        if let Some(cart) = self.cart.as_mut() {
            if let Some(data) = cart.cpu_read(addr) {
                return data;
            }
        }

        match addr {
            // 2 KiB of system RAM, mirrored through the 8 KiB range.
            0x0000..=0x1FFF => self.wram[(addr & 0x07FF) as usize],
            // Eight PPU registers, mirrored every 8 bytes.
            0x2000..=0x3FFF => match self.cart.as_mut() {
                Some(cart) => self.ppu.cpu_read(addr & 0x0007, cart),
                None => 0,
            },
            // APU status. $4017 reads the second controller, not the APU.
            0x4000..=0x4013 | 0x4015 => self.apu.cpu_read(addr),
            0x4016 => {
                let data = (self.controller_state[0] & 0x80 != 0) as u8;
                self.controller_state[0] <<= 1;
                data
            }
            0x4017 => {
                let data = (self.controller_state[1] & 0x80 != 0) as u8;
                self.controller_state[1] <<= 1;
                data
            }
            _ => 0,
        }
    }

    fn write(&mut self, addr: u16, data: u8) {
        if let Some(cart) = self.cart.as_mut() {
            if cart.cpu_write(addr, data) {
                return;
            }
        }

        match addr {
            0x0000..=0x1FFF => self.wram[(addr & 0x07FF) as usize] = data,
            0x2000..=0x3FFF => {
                if let Some(cart) = self.cart.as_mut() {
                    self.ppu.cpu_write(addr & 0x0007, data, cart);
                }
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.cpu_write(addr, data),
            0x4014 => {
                // Arm OAM DMA; the page forms the high byte of the source
                // address, the low byte counts up from zero.
                self.dma.page = data;
                self.dma.addr = 0;
                self.dma.transfer = true;
            }
            0x4016 => {
                // Writing 1 latches the live button state of both ports into
                // their shift registers.
                if data & 0x01 != 0 {
                    self.controller_state[0] = self.controller[0];
                    self.controller_state[1] = self.controller[1];
                }
            }
            _ => {}
        }
    }
}

/// The NES console: devices, memory, clock distribution.
pub struct NesBus {
    pub cpu: CPU,
    pub ppu: PPU,
    pub apu: APU,
    pub cart: Option<Cartridge>,
    wram: [u8; 2048],

    /// Live button state per port, written by the input layer
    /// (bit 7..0 = A, B, Select, Start, Up, Down, Left, Right).
    pub controller: [u8; 2],
    /// Latched shift registers, serialized out MSB-first via $4016/$4017.
    controller_state: [u8; 2],

    dma: OamDma,
    system_clock_counter: u64,

    /// Console power switch. The core ignores it; the audio/video drivers use
    /// it to decide between running the emulation and emitting static.
    pub is_powered_on: bool,
}

impl Default for NesBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NesBus {
    /// A console with an empty cartridge slot.
    pub fn new() -> Self {
        Self {
            cpu: CPU::new(),
            ppu: PPU::new(),
            apu: APU::new(),
            cart: None,
            wram: [0; 2048],
            controller: [0; 2],
            controller_state: [0; 2],
            dma: OamDma::new(),
            system_clock_counter: 0,
            is_powered_on: false,
        }
    }

    fn view(&mut self) -> CpuView<'_> {
        CpuView {
            wram: &mut self.wram,
            ppu: &mut self.ppu,
            apu: &mut self.apu,
            cart: &mut self.cart,
            controller: &self.controller,
            controller_state: &mut self.controller_state,
            dma: &mut self.dma,
        }
    }

    /// Split-borrow helper: hand the CPU a memory view over the rest of the
    /// bus for the duration of one call.
    fn with_cpu<R>(&mut self, f: impl FnOnce(&mut CPU, &mut dyn Bus) -> R) -> R {
        let NesBus {
            cpu,
            ppu,
            apu,
            cart,
            wram,
            controller,
            controller_state,
            dma,
            ..
        } = self;
        let mut view = CpuView {
            wram,
            ppu,
            apu,
            cart,
            controller,
            controller_state,
            dma,
        };
        f(cpu, &mut view)
    }

    /// Read from the CPU address space (external debug/driver access uses the
    /// same decode as the CPU itself).
    pub fn cpu_read(&mut self, addr: u16) -> u8 {
        self.view().read(addr)
    }

    /// Write to the CPU address space.
    pub fn cpu_write(&mut self, addr: u16, data: u8) {
        self.view().write(addr, data);
    }

    /// Install a cartridge. The caller decides when to `reset`.
    pub fn insert_cartridge(&mut self, cart: Cartridge) {
        self.cart = Some(cart);
    }

    /// Reinitialize every device and the bus-side latches. ROM contents are
    /// untouched; without a cartridge the CPU cannot fetch its reset vector
    /// and stays parked until one is inserted and `reset` runs again.
    pub fn reset(&mut self) {
        self.wram = [0; 2048];
        self.cpu = CPU::new();
        self.ppu.reset();
        self.apu.reset();
        self.controller = [0; 2];
        self.controller_state = [0; 2];
        self.dma = OamDma::new();
        self.system_clock_counter = 0;

        if let Some(cart) = self.cart.as_mut() {
            cart.reset();
        }
        if self.cart.is_some() {
            self.with_cpu(|cpu, bus| cpu.reset(bus));
        }
    }

    pub fn power_on(&mut self) {
        self.is_powered_on = true;
    }

    pub fn power_off(&mut self) {
        self.is_powered_on = false;
    }

    /// Advance the whole machine by one PPU dot. The PPU is the fastest clock
    /// in the system, so it ticks every call; the CPU and APU tick every third
    /// call, with OAM DMA stealing the CPU's slot while a transfer runs. A
    /// pending NMI from the PPU is delivered at the end of the call.
    pub fn clock(&mut self) {
        if let Some(cart) = self.cart.as_mut() {
            self.ppu.clock(cart);
        }

        if self.system_clock_counter % 3 == 0 {
            // The APU nominally runs at half CPU speed but changes state on
            // CPU edges, so it is clocked at CPU rate.
            self.apu.clock();

            // Service at most one DMC sample fetch through the CPU read path.
            // The CPU is not stalled for it.
            if let Some(addr) = self.apu.dmc_wants_fetch() {
                let byte = self.view().read(addr);
                self.apu.dmc_feed_byte(byte);
            }

            if self.dma.transfer {
                if self.dma.dummy {
                    // Wait for an even CPU cycle before the transfer starts.
                    if self.system_clock_counter % 2 == 1 {
                        self.dma.dummy = false;
                    }
                } else if self.system_clock_counter % 2 == 0 {
                    let addr = ((self.dma.page as u16) << 8) | self.dma.addr as u16;
                    let data = self.view().read(addr);
                    self.dma.data = data;
                } else {
                    self.ppu.oam[self.dma.addr as usize] = self.dma.data;
                    self.dma.addr = self.dma.addr.wrapping_add(1);
                    // Wrapping back to zero means all 256 bytes have moved.
                    if self.dma.addr == 0 {
                        self.ppu.populate_oam();
                        self.dma.transfer = false;
                        self.dma.dummy = true;
                    }
                }
            } else {
                self.with_cpu(|cpu, bus| cpu.clock(bus));
            }
        }

        if self.ppu.nmi {
            self.ppu.nmi = false;
            self.with_cpu(|cpu, bus| cpu.nmi(bus));
        }

        self.system_clock_counter += 1;
    }

    /// Single-step support: run system clocks until the CPU has executed one
    /// whole instruction, then drain the clocks where it idles complete.
    pub fn run_cpu_instruction(&mut self) {
        loop {
            let done = self.with_cpu(|cpu, bus| {
                cpu.clock(bus);
                cpu.complete()
            });
            if done {
                break;
            }
        }
        loop {
            self.clock();
            if !self.cpu.complete() {
                break;
            }
        }
    }
}

/// The console as a whole also satisfies the CPU's memory seam, which lets
/// debug tooling (disassembler, trace mode) read through the full decode.
impl Bus for NesBus {
    fn read(&mut self, addr: u16) -> u8 {
        self.cpu_read(addr)
    }

    fn write(&mut self, addr: u16, data: u8) {
        self.cpu_write(addr, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cart() -> Cartridge {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = 1;
        bytes[5] = 0;
        bytes[6] = 0x01;
        bytes.extend(std::iter::repeat(0).take(16 * 1024));
        Cartridge::from_ines_bytes(&bytes).unwrap()
    }

    #[test]
    fn wram_is_mirrored_every_2k() {
        let mut nes = NesBus::new();
        nes.cpu_write(0x0001, 0xAB);
        assert_eq!(nes.cpu_read(0x0001), 0xAB);
        assert_eq!(nes.cpu_read(0x0801), 0xAB);
        assert_eq!(nes.cpu_read(0x1001), 0xAB);
        assert_eq!(nes.cpu_read(0x1801), 0xAB);

        nes.cpu_write(0x1FFF, 0xCD);
        assert_eq!(nes.cpu_read(0x07FF), 0xCD);
    }

    #[test]
    fn unmapped_reads_return_zero() {
        let mut nes = NesBus::new();
        assert_eq!(nes.cpu_read(0x5000), 0);
        assert_eq!(nes.cpu_read(0x8123), 0); // no cartridge installed
    }

    #[test]
    fn controllers_latch_on_strobe_and_shift_msb_first() {
        let mut nes = NesBus::new();
        nes.controller[0] = 0b1011_0001;

        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);

        // Changing the live state after the latch must not affect the shift-out.
        nes.controller[0] = 0;

        let bits: Vec<u8> = (0..8).map(|_| nes.cpu_read(0x4016)).collect();
        assert_eq!(bits, vec![1, 0, 1, 1, 0, 0, 0, 1]);
        // Exhausted register shifts out zeros.
        assert_eq!(nes.cpu_read(0x4016), 0);
    }

    #[test]
    fn controller_ports_are_independent() {
        let mut nes = NesBus::new();
        nes.controller[0] = 0x80;
        nes.controller[1] = 0x40;

        nes.cpu_write(0x4016, 1);

        assert_eq!(nes.cpu_read(0x4016), 1);
        assert_eq!(nes.cpu_read(0x4017), 0);
        assert_eq!(nes.cpu_read(0x4017), 1);
    }

    #[test]
    fn oam_dma_copies_a_page_into_oam() {
        let mut nes = NesBus::new();
        nes.insert_cartridge(test_cart());
        nes.reset();

        for i in 0..256u16 {
            nes.cpu_write(0x0200 + i, i as u8);
        }
        nes.cpu_write(0x4014, 0x02);

        // 1 dummy + 512 transfer CPU cycles, at one CPU cycle per 3 dots.
        for _ in 0..6000 {
            nes.clock();
        }

        for i in 0..256usize {
            assert_eq!(nes.ppu.oam[i], i as u8);
        }
    }

    #[test]
    fn clock_without_cartridge_is_inert() {
        let mut nes = NesBus::new();
        for _ in 0..1000 {
            nes.clock();
        }
    }

    #[test]
    fn reset_clears_wram_and_reloads_the_vector() {
        let mut nes = NesBus::new();
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(b"NES\x1A");
        bytes[4] = 1;
        bytes[5] = 0;
        bytes[6] = 0x01;
        let mut prg = vec![0u8; 16 * 1024];
        // Reset vector at $FFFC (PRG offset $3FFC in a 16 KiB bank) -> $8005.
        prg[0x3FFC] = 0x05;
        prg[0x3FFD] = 0x80;
        bytes.extend(prg);
        let cart = Cartridge::from_ines_bytes(&bytes).unwrap();

        nes.insert_cartridge(cart);
        nes.cpu_write(0x0123, 0x77);
        nes.reset();

        assert_eq!(nes.cpu.pc, 0x8005);
        assert_eq!(nes.cpu_read(0x0123), 0x00);
    }
}
