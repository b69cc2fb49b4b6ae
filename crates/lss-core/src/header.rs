//! The static header at offset 0: immutable store geometry.

use asupersync::Cx;
use lss_error::{LssError, Result};
use lss_file::{AlignedVec, ByteDevice};
use lss_types::{StaticConfig, read_le_u32, read_le_u64};

const HEADER_MAGIC: &[u8; 8] = b"lssfile\0";
const HEADER_VERSION: u32 = 1;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_BLOCK_SIZE: usize = 12;
const OFF_EXTENT_SIZE: usize = 16;
const OFF_CRC: usize = 24;
const HEADER_BYTES: usize = 28;

/// Smallest unit the header can be read with before the geometry is
/// known; every supported block size is at least this large.
const HEADER_READ_BYTES: usize = 1024;

pub fn write_static_header(cx: &Cx, device: &dyn ByteDevice, config: StaticConfig) -> Result<()> {
    let mut block = AlignedVec::new(config.block_size.bytes());
    let buf = block.as_mut_slice();
    buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(HEADER_MAGIC);
    buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4]
        .copy_from_slice(&config.block_size.get().to_le_bytes());
    buf[OFF_EXTENT_SIZE..OFF_EXTENT_SIZE + 8]
        .copy_from_slice(&config.extent_size.get().to_le_bytes());
    let crc = crc32c::crc32c(&buf[..OFF_CRC]);
    buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    device.write_all_at(cx, 0, block.as_slice())
}

pub fn read_static_header(cx: &Cx, device: &dyn ByteDevice) -> Result<StaticConfig> {
    let mut block = AlignedVec::new(HEADER_READ_BYTES);
    device.read_exact_at(cx, 0, block.as_mut_slice())?;
    let buf = block.as_slice();

    if &buf[OFF_MAGIC..OFF_MAGIC + 8] != HEADER_MAGIC {
        return Err(LssError::Corruption {
            offset: 0,
            detail: "static header magic mismatch".to_owned(),
        });
    }
    let version = read_le_u32(buf, OFF_VERSION)?;
    if version != HEADER_VERSION {
        return Err(LssError::Format(format!(
            "unsupported store version {version}"
        )));
    }
    let stored_crc = read_le_u32(buf, OFF_CRC)?;
    if stored_crc != crc32c::crc32c(&buf[..OFF_CRC]) {
        return Err(LssError::Corruption {
            offset: 0,
            detail: "static header checksum mismatch".to_owned(),
        });
    }

    let block_size = read_le_u32(buf, OFF_BLOCK_SIZE)?;
    let extent_size = read_le_u64(buf, OFF_EXTENT_SIZE)?;
    StaticConfig::new(block_size, extent_size).map_err(LssError::Parse)
}
