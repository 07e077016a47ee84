//! Cartridge image loading and header parsing.

use crate::{CoreError, CoreResult};

/// Memory bank controller wired to the cartridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
}

impl MbcType {
    /// Determines controller type, RAM presence and battery presence from the
    /// cartridge-type byte at 0x0147.
    pub fn from_header(cartridge_type: u8) -> CoreResult<(Self, bool, bool)> {
        match cartridge_type {
            0x00 => Ok((MbcType::NoMbc, false, false)),
            0x01 => Ok((MbcType::Mbc1, false, false)),
            0x02 => Ok((MbcType::Mbc1, true, false)),
            0x03 => Ok((MbcType::Mbc1, true, true)),
            0x08 => Ok((MbcType::NoMbc, true, false)),
            0x09 => Ok((MbcType::NoMbc, true, true)),
            other => Err(CoreError::Rom(format!(
                "unsupported cartridge type {:#04X}",
                other
            ))),
        }
    }
}

/// Parsed cartridge header (0x0134..0x014F).
#[derive(Debug, Clone)]
pub struct Header {
    pub title: String,
    pub cartridge_type: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
    pub header_checksum: u8,
    pub global_checksum: u16,
}

/// An immutable ROM image plus the facts the MMU needs from its header.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub data: Vec<u8>,
    pub header: Header,
    pub is_valid: bool,
    pub mbc: MbcType,
    pub has_ram: bool,
    pub has_battery: bool,
    pub rom_banks: usize,
    pub ram_size: usize,
}

impl Cartridge {
    pub fn load(data: Vec<u8>) -> CoreResult<Self> {
        if data.len() < 0x0150 {
            return Err(CoreError::Rom(format!(
                "image too small for a header: {} bytes",
                data.len()
            )));
        }

        let title_bytes = &data[0x0134..0x0144];
        let title = title_bytes
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
            .collect::<String>();

        let header = Header {
            title,
            cartridge_type: data[0x0147],
            rom_size_code: data[0x0148],
            ram_size_code: data[0x0149],
            header_checksum: data[0x014D],
            global_checksum: u16::from_be_bytes([data[0x014E], data[0x014F]]),
        };

        let is_valid = compute_header_checksum(&data) == header.header_checksum;
        if !is_valid {
            log::warn!(
                "header checksum mismatch: computed {:#04X}, header says {:#04X}",
                compute_header_checksum(&data),
                header.header_checksum
            );
        }

        let (mbc, has_ram, has_battery) = MbcType::from_header(header.cartridge_type)?;

        let rom_banks = match header.rom_size_code {
            code @ 0x00..=0x08 => 2usize << code,
            other => {
                return Err(CoreError::Rom(format!(
                    "unsupported ROM size code {:#04X}",
                    other
                )));
            }
        };
        if data.len() < rom_banks * 0x4000 {
            log::warn!(
                "ROM file is {} bytes but the header implies {}; short reads return 0xFF",
                data.len(),
                rom_banks * 0x4000
            );
        }

        let ram_size = match header.ram_size_code {
            0x00 => 0,
            0x01 => 2 * 1024,
            0x02 => 8 * 1024,
            0x03 => 32 * 1024,
            other => {
                return Err(CoreError::Rom(format!(
                    "unsupported RAM size code {:#04X}",
                    other
                )));
            }
        };

        Ok(Cartridge {
            data,
            header,
            is_valid,
            mbc,
            has_ram: has_ram && ram_size > 0,
            has_battery,
            rom_banks,
            ram_size,
        })
    }
}

/// Subtractive checksum over 0x0134..=0x014C, compared against 0x014D.
pub fn compute_header_checksum(data: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in &data[0x0134..=0x014C] {
        sum = sum.wrapping_sub(byte).wrapping_sub(1);
    }
    sum
}
