//! Picture processing unit: dot-clocked mode state machine and frame buffer.
//!
//! The engine steps the PPU with every block's cycle cost. Mode boundaries
//! fall at dot 80 (OAM scan ends), dot 252 (pixel transfer ends, scanline is
//! rendered) and dot 456 (line complete). Entering line 144 raises the
//! V-Blank interrupt; lines 144..=153 idle in V-Blank and the counter wraps
//! at 154.

mod constants;
mod render;

pub use constants::{FRAME_BUFFER_SIZE, GB_HEIGHT, GB_WIDTH};
use constants::*;

use crate::memory_map::{self, LCD_STAT_INTERRUPT_BIT, VBLANK_INTERRUPT_BIT};
use crate::mmu::Mmu;

/// Internal timing/mode state.
#[derive(Debug, Clone)]
struct PpuState {
    dots: u32,
    scanline: u8,
    mode: u8,
    lyc_eq_ly: bool,
    /// Level of the combined STAT interrupt condition; requests fire on the
    /// rising edge only.
    stat_line: bool,
    vblank_raised: bool,
}

impl PpuState {
    fn new() -> Self {
        PpuState {
            dots: 0,
            scanline: 0,
            mode: OAM_SCAN_MODE,
            lyc_eq_ly: false,
            stat_line: false,
            vblank_raised: false,
        }
    }

    fn reset_for_lcd_off(&mut self) {
        self.dots = 0;
        self.scanline = 0;
        self.mode = HBLANK_MODE;
        self.lyc_eq_ly = false;
        self.stat_line = false;
    }
}

pub struct Ppu {
    frame_buffer: Box<[u8; FRAME_BUFFER_SIZE]>,
    state: PpuState,
    frames_completed: u64,
}

impl Ppu {
    pub fn new() -> Self {
        Ppu {
            frame_buffer: Box::new([0; FRAME_BUFFER_SIZE]),
            state: PpuState::new(),
            frames_completed: 0,
        }
    }

    /// The 160x144 RGBA frame buffer.
    pub fn frame_buffer(&self) -> &[u8; FRAME_BUFFER_SIZE] {
        &self.frame_buffer
    }

    pub fn mode(&self) -> u8 {
        self.state.mode
    }

    pub fn scanline(&self) -> u8 {
        self.state.scanline
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Advances the dot counter by `cycles` T-cycles, moving through the mode
    /// machine and raising interrupts through the bus.
    pub fn step(&mut self, cycles: u32, mmu: &mut Mmu) {
        let lcdc = mmu.io_reg(memory_map::LCDC_ADDR);
        if lcdc & (1 << LCDC_LCD_ENABLE) == 0 {
            if self.state.dots != 0 || self.state.scanline != 0 || self.state.mode != HBLANK_MODE
            {
                self.state.reset_for_lcd_off();
                mmu.set_io_reg_direct(memory_map::LY_ADDR, 0);
            }
            return;
        }

        self.state.dots += cycles;
        loop {
            match self.state.mode {
                OAM_SCAN_MODE => {
                    if self.state.dots < MODE2_OAM_SCAN_DOTS {
                        break;
                    }
                    self.state.dots -= MODE2_OAM_SCAN_DOTS;
                    self.state.mode = TRANSFER_MODE;
                }
                TRANSFER_MODE => {
                    if self.state.dots < MODE3_TRANSFER_DOTS {
                        break;
                    }
                    self.state.dots -= MODE3_TRANSFER_DOTS;
                    self.state.mode = HBLANK_MODE;
                    self.render_current_line(mmu);
                }
                HBLANK_MODE => {
                    // Remaining dots of the 456-dot line.
                    let hblank = DOTS_PER_SCANLINE - MODE2_OAM_SCAN_DOTS - MODE3_TRANSFER_DOTS;
                    if self.state.dots < hblank {
                        break;
                    }
                    self.state.dots -= hblank;
                    self.state.scanline += 1;
                    if self.state.scanline == GB_HEIGHT as u8 {
                        self.state.mode = VBLANK_MODE;
                        self.state.vblank_raised = true;
                        self.frames_completed += 1;
                    } else {
                        self.state.mode = OAM_SCAN_MODE;
                    }
                    mmu.set_io_reg_direct(memory_map::LY_ADDR, self.state.scanline);
                }
                VBLANK_MODE => {
                    if self.state.dots < DOTS_PER_SCANLINE {
                        break;
                    }
                    self.state.dots -= DOTS_PER_SCANLINE;
                    self.state.scanline += 1;
                    if self.state.scanline == SCANLINES_PER_FRAME {
                        self.state.scanline = 0;
                        self.state.mode = OAM_SCAN_MODE;
                    }
                    mmu.set_io_reg_direct(memory_map::LY_ADDR, self.state.scanline);
                }
                _ => unreachable!("invalid PPU mode {}", self.state.mode),
            }
        }

        self.update_coincidence(mmu);
        self.write_stat(mmu);
        self.dispatch_interrupts(mmu);
    }

    fn render_current_line(&mut self, mmu: &Mmu) {
        let y = self.state.scanline as usize;
        if y < GB_HEIGHT {
            let start = y * GB_WIDTH * BYTES_PER_PIXEL;
            let end = start + GB_WIDTH * BYTES_PER_PIXEL;
            render::render_scanline(&mut self.frame_buffer[start..end], self.state.scanline, mmu);
        }
    }

    fn update_coincidence(&mut self, mmu: &Mmu) {
        let lyc = mmu.io_reg(memory_map::LYC_ADDR);
        self.state.lyc_eq_ly = self.state.scanline == lyc;
    }

    /// Rewrites the read-only STAT bits (mode, coincidence) around the
    /// guest-writable interrupt enables.
    fn write_stat(&self, mmu: &mut Mmu) {
        let enables = mmu.io_reg(memory_map::STAT_ADDR) & 0b0111_1000;
        let mut stat = 0x80 | enables | self.state.mode;
        if self.state.lyc_eq_ly {
            stat |= 1 << STAT_LYC_EQ_LY_FLAG;
        }
        mmu.set_io_reg_direct(memory_map::STAT_ADDR, stat);
    }

    fn dispatch_interrupts(&mut self, mmu: &mut Mmu) {
        if self.state.vblank_raised {
            mmu.request_interrupt(VBLANK_INTERRUPT_BIT);
            self.state.vblank_raised = false;
        }

        let stat = mmu.io_reg(memory_map::STAT_ADDR);
        let mut level = false;
        if stat & (1 << STAT_LYC_IE) != 0 && self.state.lyc_eq_ly {
            level = true;
        }
        if stat & (1 << STAT_HBLANK_IE) != 0 && self.state.mode == HBLANK_MODE {
            level = true;
        }
        if stat & (1 << STAT_VBLANK_IE) != 0 && self.state.mode == VBLANK_MODE {
            level = true;
        }
        if stat & (1 << STAT_OAM_IE) != 0 && self.state.mode == OAM_SCAN_MODE {
            level = true;
        }
        if level && !self.state.stat_line {
            mmu.request_interrupt(LCD_STAT_INTERRUPT_BIT);
        }
        self.state.stat_line = level;
    }
}

impl Default for Ppu {
    fn default() -> Self {
        Ppu::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::{Cartridge, compute_header_checksum};
    use crate::memory_map::{IF_ADDR, LCDC_ADDR, LY_ADDR, LYC_ADDR, STAT_ADDR};

    fn setup() -> (Ppu, Mmu) {
        let mut rom = vec![0u8; 0x8000];
        rom[0x014D] = compute_header_checksum(&rom);
        let cart = Cartridge::load(rom).unwrap();
        let mut mmu = Mmu::new(&cart);
        mmu.set_io_reg_direct(LCDC_ADDR, 0x91); // LCD on
        (Ppu::new(), mmu)
    }

    #[test]
    fn mode_walk_through_one_scanline() {
        let (mut ppu, mut mmu) = setup();
        assert_eq!(ppu.mode(), OAM_SCAN_MODE);
        ppu.step(80, &mut mmu);
        assert_eq!(ppu.mode(), TRANSFER_MODE);
        ppu.step(172, &mut mmu);
        assert_eq!(ppu.mode(), HBLANK_MODE);
        ppu.step(204, &mut mmu); // completes dot 456
        assert_eq!(ppu.mode(), OAM_SCAN_MODE);
        assert_eq!(ppu.scanline(), 1);
        assert_eq!(mmu.io_reg(LY_ADDR), 1);
    }

    #[test]
    fn vblank_raises_if_bit_zero_at_line_144() {
        let (mut ppu, mut mmu) = setup();
        for _ in 0..GB_HEIGHT {
            ppu.step(DOTS_PER_SCANLINE, &mut mmu);
        }
        assert_eq!(ppu.mode(), VBLANK_MODE);
        assert_eq!(ppu.scanline(), 144);
        assert_eq!(mmu.io_reg(IF_ADDR) & 0x01, 0x01);
    }

    #[test]
    fn frame_wraps_at_line_154() {
        let (mut ppu, mut mmu) = setup();
        for _ in 0..SCANLINES_PER_FRAME {
            ppu.step(DOTS_PER_SCANLINE, &mut mmu);
        }
        assert_eq!(ppu.scanline(), 0);
        assert_eq!(ppu.mode(), OAM_SCAN_MODE);
        assert_eq!(ppu.frames_completed(), 1);
    }

    #[test]
    fn lyc_coincidence_sets_stat_flag_and_interrupt() {
        let (mut ppu, mut mmu) = setup();
        mmu.set_io_reg_direct(LYC_ADDR, 1);
        mmu.set_io_reg_direct(STAT_ADDR, 1 << STAT_LYC_IE);
        ppu.step(DOTS_PER_SCANLINE, &mut mmu); // into line 1
        assert_ne!(mmu.io_reg(STAT_ADDR) & (1 << STAT_LYC_EQ_LY_FLAG), 0);
        assert_ne!(mmu.io_reg(IF_ADDR) & 0x02, 0);
    }

    #[test]
    fn lcd_off_holds_line_zero() {
        let (mut ppu, mut mmu) = setup();
        ppu.step(1000, &mut mmu);
        mmu.set_io_reg_direct(LCDC_ADDR, 0x00);
        ppu.step(10_000, &mut mmu);
        assert_eq!(mmu.io_reg(LY_ADDR), 0);
        assert_eq!(ppu.scanline(), 0);
    }
}
