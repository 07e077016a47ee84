#![allow(dead_code)] // Full register/flag layout kept for reference.

// --- Screen ---
pub const GB_WIDTH: usize = 160;
pub const GB_HEIGHT: usize = 144;
pub const BYTES_PER_PIXEL: usize = 4; // RGBA
pub const FRAME_BUFFER_SIZE: usize = GB_WIDTH * GB_HEIGHT * BYTES_PER_PIXEL;

// --- Timing (T-cycles, "dots") ---
pub const DOTS_PER_SCANLINE: u32 = 456;
pub const SCANLINES_PER_FRAME: u8 = 154; // 144 visible + 10 V-Blank
pub const MODE2_OAM_SCAN_DOTS: u32 = 80;
pub const MODE3_TRANSFER_DOTS: u32 = 172; // ends at dot 252

// --- Modes (STAT bits 0-1) ---
pub const HBLANK_MODE: u8 = 0;
pub const VBLANK_MODE: u8 = 1;
pub const OAM_SCAN_MODE: u8 = 2;
pub const TRANSFER_MODE: u8 = 3;

// --- LCDC bits ---
pub const LCDC_BG_ENABLE: u8 = 0;
pub const LCDC_OBJ_ENABLE: u8 = 1;
pub const LCDC_OBJ_SIZE: u8 = 2;
pub const LCDC_BG_MAP_AREA: u8 = 3;
pub const LCDC_TILE_DATA_AREA: u8 = 4;
pub const LCDC_WINDOW_ENABLE: u8 = 5;
pub const LCDC_WINDOW_MAP_AREA: u8 = 6;
pub const LCDC_LCD_ENABLE: u8 = 7;

// --- STAT bits ---
pub const STAT_LYC_EQ_LY_FLAG: u8 = 2;
pub const STAT_HBLANK_IE: u8 = 3;
pub const STAT_VBLANK_IE: u8 = 4;
pub const STAT_OAM_IE: u8 = 5;
pub const STAT_LYC_IE: u8 = 6;

// --- OAM attribute bits ---
pub const OAM_PALETTE: u8 = 4;
pub const OAM_X_FLIP: u8 = 5;
pub const OAM_Y_FLIP: u8 = 6;
pub const OAM_BG_PRIORITY: u8 = 7;

/// DMG shade 0..=3 to an RGBA ramp.
pub const SHADE_RGBA: [[u8; 4]; 4] = [
    [0xE0, 0xF8, 0xD0, 0xFF],
    [0x88, 0xC0, 0x70, 0xFF],
    [0x34, 0x68, 0x56, 0xFF],
    [0x08, 0x18, 0x20, 0xFF],
];
