//! Alternating superblock pages, bit-exact field ordering.
//!
//! Two pages (ids 0 and 1) alternate as the durable root of the database;
//! whichever has the higher `redo_position` and a valid checksum is
//! authoritative at open. Generalized from a single meta page into a
//! double-buffered commit protocol: a crash mid-write leaves the other slot
//! intact and recoverable.

use crate::config::{PageId, PAGE_SIZE};
use crate::error::{Error, Result};

pub const MAGIC: u64 = 0x5475706c_44425630; // "TuplDBV0" trimmed to 8 bytes
pub const FORMAT_VERSION: u32 = 1;
pub const EXTRA_DATA_LEN: usize = 256;

pub const FIELD_MAGIC: usize = 0;
pub const FIELD_VERSION: usize = 8;
pub const FIELD_PAGE_SIZE: usize = 12;
pub const FIELD_PAGE_COUNT: usize = 16;
pub const FIELD_FREE_LIST_HEAD: usize = 24;
pub const FIELD_REDO_POSITION: usize = 32;
pub const FIELD_LAST_TXN_ID: usize = 40;
pub const FIELD_EXTRA_DATA: usize = 48;
pub const FIELD_CHECKSUM: usize = FIELD_EXTRA_DATA + EXTRA_DATA_LEN;
pub const HEADER_LEN: usize = FIELD_CHECKSUM + 8;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub page_size: u32,
    pub page_count: u64,
    pub free_list_head: PageId,
    pub redo_position: u64,
    pub last_txn_id: u64,
    pub extra_data: [u8; EXTRA_DATA_LEN],
}

impl Superblock {
    pub fn fresh() -> Superblock {
        Superblock {
            page_size: PAGE_SIZE as u32,
            page_count: 2,
            free_list_head: 0,
            redo_position: 0,
            last_txn_id: 0,
            extra_data: [0u8; EXTRA_DATA_LEN],
        }
    }

    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[FIELD_MAGIC..FIELD_MAGIC + 8].copy_from_slice(&MAGIC.to_be_bytes());
        buf[FIELD_VERSION..FIELD_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[FIELD_PAGE_SIZE..FIELD_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_be_bytes());
        buf[FIELD_PAGE_COUNT..FIELD_PAGE_COUNT + 8].copy_from_slice(&self.page_count.to_be_bytes());
        buf[FIELD_FREE_LIST_HEAD..FIELD_FREE_LIST_HEAD + 8]
            .copy_from_slice(&self.free_list_head.to_be_bytes());
        buf[FIELD_REDO_POSITION..FIELD_REDO_POSITION + 8]
            .copy_from_slice(&self.redo_position.to_be_bytes());
        buf[FIELD_LAST_TXN_ID..FIELD_LAST_TXN_ID + 8].copy_from_slice(&self.last_txn_id.to_be_bytes());
        buf[FIELD_EXTRA_DATA..FIELD_EXTRA_DATA + EXTRA_DATA_LEN].copy_from_slice(&self.extra_data);
        let checksum = crc32c::crc32c(&buf[..FIELD_CHECKSUM]) as u64;
        buf[FIELD_CHECKSUM..FIELD_CHECKSUM + 8].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PAGE_SIZE]) -> Result<Superblock> {
        let magic = u64::from_be_bytes(buf[FIELD_MAGIC..FIELD_MAGIC + 8].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::Corrupt("superblock magic mismatch".into()));
        }
        let checksum = u64::from_be_bytes(buf[FIELD_CHECKSUM..FIELD_CHECKSUM + 8].try_into().unwrap());
        let computed = crc32c::crc32c(&buf[..FIELD_CHECKSUM]) as u64;
        if checksum != computed {
            return Err(Error::ChecksumMismatch { what: "superblock" });
        }
        let version = u32::from_be_bytes(buf[FIELD_VERSION..FIELD_VERSION + 4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!("unsupported format version {version}")));
        }
        let page_size = u32::from_be_bytes(buf[FIELD_PAGE_SIZE..FIELD_PAGE_SIZE + 4].try_into().unwrap());
        let page_count = u64::from_be_bytes(buf[FIELD_PAGE_COUNT..FIELD_PAGE_COUNT + 8].try_into().unwrap());
        let free_list_head =
            PageId::from_be_bytes(buf[FIELD_FREE_LIST_HEAD..FIELD_FREE_LIST_HEAD + 8].try_into().unwrap());
        let redo_position =
            u64::from_be_bytes(buf[FIELD_REDO_POSITION..FIELD_REDO_POSITION + 8].try_into().unwrap());
        let last_txn_id =
            u64::from_be_bytes(buf[FIELD_LAST_TXN_ID..FIELD_LAST_TXN_ID + 8].try_into().unwrap());
        let mut extra_data = [0u8; EXTRA_DATA_LEN];
        extra_data.copy_from_slice(&buf[FIELD_EXTRA_DATA..FIELD_EXTRA_DATA + EXTRA_DATA_LEN]);
        Ok(Superblock { page_size, page_count, free_list_head, redo_position, last_txn_id, extra_data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut sb = Superblock::fresh();
        sb.page_count = 42;
        sb.redo_position = 100;
        let encoded = sb.encode();
        let decoded = Superblock::decode(&encoded).unwrap();
        assert_eq!(decoded.page_count, 42);
        assert_eq!(decoded.redo_position, 100);
    }

    #[test]
    fn rejects_corrupt_checksum() {
        let sb = Superblock::fresh();
        let mut encoded = sb.encode();
        encoded[FIELD_PAGE_COUNT] ^= 0xff;
        assert!(matches!(Superblock::decode(&encoded), Err(Error::ChecksumMismatch { .. })));
    }
}
