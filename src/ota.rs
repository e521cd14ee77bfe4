//! Firmware download session support.
//!
//! The controller announces the expected firmware in an 8-byte config
//! record. When the announced record differs from the stored one the node
//! opens a download session and pulls the image block by block into the
//! flash staging area, highest block first. A finished image is accepted
//! only if its CRC-16 matches the config record; the bootloader picks the
//! staged image up through the header written at flash offset 0.

use crc::{Crc, CRC_16_MODBUS};

use crate::hal::{FirmwareStore, Platform};
use crate::routing::{self, NV_FIRMWARE_CONFIG_ADDRESS};
use crate::{FIRMWARE_BLOCK_SIZE, FIRMWARE_START_OFFSET, OTA_RETRY};

/// Image checksum algorithm shared with the controller: CRC-16/MODBUS,
/// reflected polynomial 0xA001 (0x8005), initial value 0xFFFF, no final xor.
const IMAGE_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Firmware block request and response payloads start with this record
/// prefix: type, version and block index, u16 little-endian each.
pub(crate) const BLOCK_PREFIX_SIZE: usize = 6;

/// Identity of a firmware image: type, version, block count and image CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareConfig {
    pub firmware_type: u16,
    pub version: u16,
    pub blocks: u16,
    pub crc: u16,
}

impl FirmwareConfig {
    pub const WIRE_SIZE: usize = 8;

    pub fn from_bytes(bytes: &[u8]) -> Option<FirmwareConfig> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(FirmwareConfig {
            firmware_type: u16::from_le_bytes([bytes[0], bytes[1]]),
            version: u16::from_le_bytes([bytes[2], bytes[3]]),
            blocks: u16::from_le_bytes([bytes[4], bytes[5]]),
            crc: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[0..2].copy_from_slice(&self.firmware_type.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.blocks.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    pub(crate) fn load<P: Platform>(platform: &P) -> FirmwareConfig {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        platform.read_config_block(NV_FIRMWARE_CONFIG_ADDRESS, &mut bytes);
        FirmwareConfig::from_bytes(&bytes).unwrap_or_default()
    }

    pub(crate) fn store<P: Platform>(platform: &mut P, config: &FirmwareConfig) {
        for (index, byte) in config.to_bytes().iter().enumerate() {
            routing::write_checked(platform, NV_FIRMWARE_CONFIG_ADDRESS + index as u16, *byte);
        }
    }
}

/// State of one download. Blocks count down from `blocks` to 1; the session
/// is complete when `next_block` reaches 0.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FirmwareSession {
    pub(crate) next_block: u16,
    pub(crate) retries: u8,
    pub(crate) last_request_time: u32,
}

impl FirmwareSession {
    pub(crate) fn new(blocks: u16) -> Self {
        FirmwareSession {
            next_block: blocks,
            retries: OTA_RETRY + 1,
            last_request_time: 0,
        }
    }
}

/// Flash offset of the block currently described by `next_block`.
pub(crate) fn block_offset(next_block: u16) -> u32 {
    (next_block as u32 - 1) * FIRMWARE_BLOCK_SIZE as u32 + FIRMWARE_START_OFFSET
}

pub(crate) fn image_checksum_matches(flash: &dyn FirmwareStore, config: &FirmwareConfig) -> bool {
    let mut digest = IMAGE_CRC.digest();
    let image_size = config.blocks as u32 * FIRMWARE_BLOCK_SIZE as u32;
    for offset in 0..image_size {
        digest.update(&[flash.read(offset + FIRMWARE_START_OFFSET)]);
    }
    digest.finalize() == config.crc
}

/// Stamp the bootloader staging header: the magic, the image size in bytes
/// (big-endian) and a closing colon.
pub(crate) fn write_staging_header(flash: &mut dyn FirmwareStore, config: &FirmwareConfig) {
    let size = config.blocks * FIRMWARE_BLOCK_SIZE as u16;
    let header: [u8; FIRMWARE_START_OFFSET as usize] = [
        b'F',
        b'L',
        b'X',
        b'I',
        b'M',
        b'G',
        b':',
        (size >> 8) as u8,
        (size & 0xFF) as u8,
        b':',
    ];
    flash.write(0, &header);
}
