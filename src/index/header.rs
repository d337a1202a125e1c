//! Serialization of the index file header page

use crate::storage::{PageNo, PAGE_SIZE};

use super::error::{IndexError, IndexResult};
use super::key::{ColumnSpec, ColumnType};

/// Magic number for index files: "SIDX" in ASCII
pub const MAGIC_NUMBER: u32 = 0x53494458;

/// Current index file version
pub const VERSION: u32 = 1;

/// Metadata stored on the reserved header page (page 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFileHeader {
    /// Page number of the root node, NO_PAGE for an empty tree
    pub root_page: PageNo,
    /// First leaf in key order
    pub first_leaf: PageNo,
    /// Last leaf in key order
    pub last_leaf: PageNo,
    /// Total pages in the file, including the two reserved ones
    pub num_pages: i32,
    /// Maximum entries per node
    pub max_size: usize,
    /// Key columns, in comparison order
    pub cols: Vec<ColumnSpec>,
}

impl IndexFileHeader {
    /// Serialize to a page-sized buffer
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut offset = 0;

        buf[offset..offset + 4].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&VERSION.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.root_page.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.first_leaf.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.last_leaf.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&self.num_pages.to_le_bytes());
        offset += 4;

        buf[offset..offset + 4].copy_from_slice(&(self.max_size as u32).to_le_bytes());
        offset += 4;

        buf[offset..offset + 2].copy_from_slice(&(self.cols.len() as u16).to_le_bytes());
        offset += 2;

        for col in &self.cols {
            buf[offset] = col.ty.tag();
            offset += 1;
            buf[offset..offset + 2].copy_from_slice(&(col.len as u16).to_le_bytes());
            offset += 2;
        }

        buf
    }

    /// Deserialize from the header page
    pub fn deserialize(buf: &[u8]) -> IndexResult<Self> {
        let mut offset = 0;

        let magic = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        if magic != MAGIC_NUMBER {
            return Err(IndexError::InvalidMagic);
        }
        offset += 4;

        let version = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        if version != VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        offset += 4;

        let root_page = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;

        let first_leaf = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;

        let last_leaf = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;

        let num_pages = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;

        let max_size = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;

        let num_cols = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
        offset += 2;

        let mut cols = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            let tag = buf[offset];
            let ty = ColumnType::from_tag(tag).ok_or(IndexError::InvalidColumnType(tag))?;
            offset += 1;
            let len = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;
            cols.push(ColumnSpec { ty, len });
        }

        Ok(Self {
            root_page,
            first_leaf,
            last_leaf,
            num_pages,
            max_size,
            cols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = IndexFileHeader {
            root_page: 2,
            first_leaf: 2,
            last_leaf: 9,
            num_pages: 12,
            max_size: 120,
            cols: vec![ColumnSpec::int(), ColumnSpec::string(16)],
        };

        let buf = header.serialize();
        assert_eq!(buf.len(), PAGE_SIZE);

        let decoded = IndexFileHeader::deserialize(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let header = IndexFileHeader {
            root_page: -1,
            first_leaf: -1,
            last_leaf: -1,
            num_pages: 3,
            max_size: 4,
            cols: vec![ColumnSpec::int()],
        };
        let mut buf = header.serialize();
        buf[0] ^= 0xff;

        assert!(matches!(
            IndexFileHeader::deserialize(&buf),
            Err(IndexError::InvalidMagic)
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let header = IndexFileHeader {
            root_page: 2,
            first_leaf: 2,
            last_leaf: 2,
            num_pages: 3,
            max_size: 4,
            cols: vec![ColumnSpec::int()],
        };
        let mut buf = header.serialize();
        buf[4..8].copy_from_slice(&99u32.to_le_bytes());

        assert!(matches!(
            IndexFileHeader::deserialize(&buf),
            Err(IndexError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_bad_column_tag_rejected() {
        let header = IndexFileHeader {
            root_page: 2,
            first_leaf: 2,
            last_leaf: 2,
            num_pages: 3,
            max_size: 4,
            cols: vec![ColumnSpec::int()],
        };
        let mut buf = header.serialize();
        // Column tags start after the fixed 30-byte prefix
        buf[30] = 9;

        assert!(matches!(
            IndexFileHeader::deserialize(&buf),
            Err(IndexError::InvalidColumnType(9))
        ));
    }
}
