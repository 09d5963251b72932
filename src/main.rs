//! NES emulator entry point.
//!
//! Loads an iNES cartridge, builds the console, and runs it with a minifb
//! window and rodio audio output. The emulation is paced by the audio device:
//! the rodio source advances the machine by exactly one sample period of
//! master-clock time per sample it produces, under a single execution mutex.
//! The window thread takes the same mutex only to latch controller input and
//! pull a completed frame out of the PPU's ring.
//!
//! Usage: famira [--trace [count]] [path/to/game.nes]
//!
//! `--trace` single-steps the CPU instead, printing a per-instruction
//! disassembly and register line (nestest style), then exits.

use std::env;
use std::process;
use std::sync::{Arc, Mutex};

use ansi_term::Colour::{Green, Red};
use famira::bus::NesBus;
use famira::cartridge::cartridge::Cartridge;
use famira::controller::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP,
};
use famira::cpu::cpu::disassemble;
use famira::ppu::ppu::{FRAME_HEIGHT, FRAME_WIDTH};
use minifb::{Key, KeyRepeat, Scale, ScaleMode, Window, WindowOptions};
use rodio::{OutputStream, Sink, Source};

/// NTSC PPU dot clock: 236.25 MHz / 11 master clock, divided by 4.
const PPU_CLOCK_HZ: f64 = 5_369_318.0;
const SAMPLE_RATE: u32 = 44_100;

/// Audio source that drives the emulation. Each `next()` runs the console for
/// one sample period of master-clock time and returns the APU's mixed output;
/// when the console is switched off it produces old-TV hiss instead.
struct NesAudioSource {
    nes: Arc<Mutex<NesBus>>,
    audio_time: f64,
    time_per_sample: f64,
    time_per_clock: f64,
    hiss_seed: u32,
}

impl NesAudioSource {
    fn new(nes: Arc<Mutex<NesBus>>) -> Self {
        Self {
            nes,
            audio_time: 0.0,
            time_per_sample: 1.0 / SAMPLE_RATE as f64,
            time_per_clock: 1.0 / PPU_CLOCK_HZ,
            hiss_seed: 0x2C02_2A03,
        }
    }

    fn hiss(&mut self) -> f32 {
        // xorshift noise, quiet.
        self.hiss_seed ^= self.hiss_seed << 13;
        self.hiss_seed ^= self.hiss_seed >> 17;
        self.hiss_seed ^= self.hiss_seed << 5;
        (self.hiss_seed as f32 / u32::MAX as f32 - 0.5) * 0.02
    }
}

impl Iterator for NesAudioSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let mut nes = self.nes.lock().unwrap();
        if !nes.is_powered_on {
            drop(nes);
            return Some(self.hiss());
        }

        while self.audio_time < self.time_per_sample {
            nes.clock();
            self.audio_time += self.time_per_clock;
        }
        self.audio_time -= self.time_per_sample;

        Some(nes.apu.get_output_sample() as f32)
    }
}

impl Source for NesAudioSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Button mask for port 1 from the current keyboard state.
fn controller_mask(window: &Window) -> u8 {
    let mut mask = 0;
    if window.is_key_down(Key::X) {
        mask |= BUTTON_A;
    }
    if window.is_key_down(Key::Z) {
        mask |= BUTTON_B;
    }
    if window.is_key_down(Key::RightShift) {
        mask |= BUTTON_SELECT;
    }
    if window.is_key_down(Key::Enter) {
        mask |= BUTTON_START;
    }
    if window.is_key_down(Key::Up) {
        mask |= BUTTON_UP;
    }
    if window.is_key_down(Key::Down) {
        mask |= BUTTON_DOWN;
    }
    if window.is_key_down(Key::Left) {
        mask |= BUTTON_LEFT;
    }
    if window.is_key_down(Key::Right) {
        mask |= BUTTON_RIGHT;
    }
    mask
}

/// Single-step `count` instructions, printing a nestest-style line for each.
fn run_trace(mut nes: NesBus, count: usize) {
    for _ in 0..count {
        let pc = nes.cpu.pc;
        let (text, _) = disassemble(&mut nes, pc);
        println!(
            "{}  {:<14} A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X}",
            Green.paint(format!("{pc:04X}")),
            text,
            nes.cpu.a,
            nes.cpu.x,
            nes.cpu.y,
            nes.cpu.status,
            nes.cpu.stkp,
        );
        nes.run_cpu_instruction();
    }
}

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut trace_count = None;
    if let Some(i) = args.iter().position(|a| a == "--trace") {
        args.remove(i);
        // Optional instruction count right after the flag.
        trace_count = Some(match args.get(i).and_then(|a| a.parse::<usize>().ok()) {
            Some(n) => {
                args.remove(i);
                n
            }
            None => 100,
        });
    }

    let path = args
        .first()
        .cloned()
        .unwrap_or_else(|| "test/nestest.nes".to_string());

    let cart = match Cartridge::load(&path) {
        Ok(cart) => cart,
        Err(e) => {
            eprintln!("{} {}", Red.bold().paint("error:"), e);
            process::exit(1);
        }
    };

    let mut nes = NesBus::new();
    nes.insert_cartridge(cart);
    nes.reset();

    if let Some(count) = trace_count {
        run_trace(nes, count);
        return;
    }

    nes.power_on();
    let nes = Arc::new(Mutex::new(nes));

    let (_stream, stream_handle) =
        OutputStream::try_default().expect("Failed to open audio output");
    let sink = Sink::try_new(&stream_handle).expect("Failed to create audio sink");
    sink.append(NesAudioSource::new(Arc::clone(&nes)));
    sink.play();

    let mut window = Window::new(
        "Famira",
        FRAME_WIDTH,
        FRAME_HEIGHT,
        WindowOptions {
            resize: true,
            scale: Scale::X2,
            scale_mode: ScaleMode::AspectRatioStretch,
            ..WindowOptions::default()
        },
    )
    .expect("Failed to create window");

    window.set_target_fps(60);

    let mut buffer = vec![0u32; FRAME_WIDTH * FRAME_HEIGHT];
    let mut next_frame: u32 = 0;
    let mut static_seed: u32 = 0xBADA55;

    while window.is_open() && !window.is_key_down(Key::Escape) {
        if window.is_key_pressed(Key::P, KeyRepeat::No) {
            let mut nes = nes.lock().unwrap();
            if nes.is_powered_on {
                nes.power_off();
            } else {
                nes.reset();
                nes.power_on();
            }
        }

        let powered_on = {
            let mut nes = nes.lock().unwrap();
            nes.controller[0] = controller_mask(&window);

            let (frame, last_drawn) = nes.ppu.get_frame(next_frame);
            if let Some(frame) = frame {
                buffer.copy_from_slice(&frame.pixels);
                next_frame = next_frame.wrapping_add(1);
            } else if last_drawn != u32::MAX {
                // Fell behind (slot already recycled) or ran ahead (frame not
                // drawn yet): resynchronize on the newest completed frame.
                next_frame = last_drawn;
            }
            nes.is_powered_on
        };

        if !powered_on {
            // Old-TV static while the console is off.
            for pixel in buffer.iter_mut() {
                static_seed ^= static_seed << 13;
                static_seed ^= static_seed >> 17;
                static_seed ^= static_seed << 5;
                let v = static_seed & 0xFF;
                *pixel = v << 16 | v << 8 | v;
            }
        }

        window
            .update_with_buffer(&buffer, FRAME_WIDTH, FRAME_HEIGHT)
            .expect("Failed to update window");
    }
}
