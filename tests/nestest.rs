//! Golden-log CPU verification against the canonical nestest ROM.
//!
//! Drives the CPU in the ROM's "automation" mode (entry at $C000, no PPU
//! involvement) and compares registers, flags and the cumulative cycle count
//! against the published nestest.log before every instruction, through the end
//! of the documented-opcode section.
//!
//! The ROM and log are not shipped with the repository; drop `nestest.nes` and
//! `nestest.log` into `tests/roms/` (or `test/`) to enable the test. Without
//! them it passes vacuously.

use std::fs;
use std::path::PathBuf;

use famira::bus::Bus;
use famira::cpu::cpu::{CPU, lookup};

/// Flat 64 KiB memory with the nestest PRG mapped at $8000/$C000 (16 KiB NROM
/// mirror), standing in for the full bus so the trace is PPU-independent.
struct FlatBus {
    mem: Vec<u8>,
}

impl Bus for FlatBus {
    fn read(&mut self, addr: u16) -> u8 {
        self.mem[addr as usize]
    }

    fn write(&mut self, addr: u16, data: u8) {
        self.mem[addr as usize] = data;
    }
}

fn find_test_file(name: &str) -> Option<PathBuf> {
    ["tests/roms", "test", "roms"]
        .iter()
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|path| path.exists())
}

struct LogEntry {
    pc: u16,
    a: u8,
    x: u8,
    y: u8,
    p: u8,
    sp: u8,
    cyc: u64,
}

fn parse_hex(s: &str, prefix: &str) -> Option<u8> {
    let start = s.find(prefix)? + prefix.len();
    u8::from_str_radix(s.get(start..start + 2)?, 16).ok()
}

/// One nestest.log line, e.g.:
/// `C000  4C F5 C5  JMP $C5F5   A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7`
fn parse_log_line(line: &str) -> Option<LogEntry> {
    let pc = u16::from_str_radix(line.get(0..4)?, 16).ok()?;
    let regs = line.get(line.find("A:")?..)?;
    let cyc_str = regs.get(regs.find("CYC:")? + 4..)?;
    Some(LogEntry {
        pc,
        a: parse_hex(regs, "A:")?,
        x: parse_hex(regs, "X:")?,
        y: parse_hex(regs, "Y:")?,
        p: parse_hex(regs, "P:")?,
        sp: parse_hex(regs, "SP:")?,
        cyc: cyc_str.trim().parse().ok()?,
    })
}

#[test]
fn nestest_golden_log() {
    let (Some(rom_path), Some(log_path)) =
        (find_test_file("nestest.nes"), find_test_file("nestest.log"))
    else {
        eprintln!("nestest.nes / nestest.log not present; skipping golden-log run");
        return;
    };

    let rom = fs::read(&rom_path).unwrap();
    let log = fs::read_to_string(&log_path).unwrap();

    let prg_len = rom[4] as usize * 16 * 1024;
    let prg = &rom[16..16 + prg_len];
    let mut bus = FlatBus {
        mem: vec![0; 65536],
    };
    bus.mem[0x8000..0x8000 + prg.len()].copy_from_slice(prg);
    if prg_len == 16 * 1024 {
        bus.mem[0xC000..0xC000 + prg.len()].copy_from_slice(prg);
    }

    // Automation entry state, as documented in the log's first line.
    let mut cpu = CPU::new();
    cpu.pc = 0xC000;
    cpu.stkp = 0xFD;
    cpu.status = 0x24;
    let mut total_cycles: u64 = 7;

    let mut matched = 0u32;
    for line in log.lines() {
        let Some(entry) = parse_log_line(line) else {
            continue;
        };

        // The trace is valid through the documented-opcode section; the
        // undocumented tests that follow are stubbed as no-ops here and would
        // diverge by design.
        let opcode = bus.mem[cpu.pc as usize];
        if lookup(opcode).name == "???" {
            break;
        }

        assert_eq!(
            cpu.pc, entry.pc,
            "PC diverged after {matched} instructions (line: {line})"
        );
        assert_eq!(cpu.a, entry.a, "A mismatch at ${:04X}", entry.pc);
        assert_eq!(cpu.x, entry.x, "X mismatch at ${:04X}", entry.pc);
        assert_eq!(cpu.y, entry.y, "Y mismatch at ${:04X}", entry.pc);
        assert_eq!(cpu.stkp, entry.sp, "SP mismatch at ${:04X}", entry.pc);
        // Bits 4/5 of P have no backing storage on a real 6502; the log and
        // the emulation can legitimately disagree about them.
        assert_eq!(
            cpu.status & !0x30,
            entry.p & !0x30,
            "P mismatch at ${:04X}",
            entry.pc
        );
        assert_eq!(
            total_cycles, entry.cyc,
            "cycle count diverged at ${:04X}",
            entry.pc
        );

        loop {
            cpu.clock(&mut bus);
            total_cycles += 1;
            if cpu.complete() {
                break;
            }
        }
        matched += 1;
    }

    assert!(
        matched > 3000,
        "only {matched} instructions verified before the trace ended"
    );
}
