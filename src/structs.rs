// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-disk structures of the sparse ("compressed") image format.
//!
//! The 64-byte header at the start of each sparse extent file uses
//! big-endian integers; the block allocation table that follows it uses
//! little-endian entries. Both orders are fixed by the format and must not
//! be normalized.

use {
    crate::error::{PhdError, Result},
    byteorder::BigEndian,
    zerocopy::{FromBytes, LayoutVerified, Unaligned, U32, U64},
};

/// Logical sector size, fixed by the format.
pub const SECTOR_SIZE: u64 = 512;

/// Sparse block granularity in sectors: 2048 sectors = 1 MiB.
pub const BLOCK_SIZE_IN_SECTORS: u64 = 2048;

pub const SPARSE_IMAGE_SIGNATURE: &[u8; 16] = b"WithoutFreeSpace";
/// Alternate signature written by some image producers.
pub const SPARSE_IMAGE_SIGNATURE_EXTENDED: &[u8; 16] = b"WithouFreSpacExt";

pub const SPARSE_IMAGE_FORMAT_VERSION: u32 = 0x0001_0000;
pub const SPARSE_IMAGE_HEADER_SIZE: usize = 64;

pub const SPARSE_IMAGE_DISK_TYPE_FIXED: u32 = 2;
pub const SPARSE_IMAGE_DISK_TYPE_DYNAMIC: u32 = 3;

/// Upper bound on the in-memory block allocation table, to keep corrupt
/// headers from driving huge allocations.
pub const MAXIMUM_ALLOCATION_TABLE_SIZE: usize = 128 * 1024 * 1024;

type BEU32 = U32<BigEndian>;
type BEU64 = U64<BigEndian>;

#[derive(Clone, Debug, FromBytes, Unaligned)]
#[repr(C)]
pub struct SparseImageHeader {
    /// Magic bytes: "WithoutFreeSpace" or "WithouFreSpacExt".
    pub signature: [u8; 16],
    /// Format version; only 0x00010000 is recognized.
    pub format_version: BEU32,
    /// Disk heads, informational.
    pub number_of_heads: BEU32,
    /// Disk cylinders, informational.
    pub number_of_cylinders: BEU32,
    /// Block size in sectors; must be 2048.
    pub block_size_in_sectors: BEU32,
    /// Number of entries in the block allocation table.
    pub number_of_allocation_table_entries: BEU32,
    /// Logical size of the image in sectors.
    pub number_of_sectors: BEU64,
    pub padding: [u8; 12],
    /// Disk type: 2 = fixed, 3 = dynamic, 4 = differential.
    pub disk_type: BEU32,
    pub reserved: BEU32,
}
assert_eq_size!(SparseImageHeader, [u8; SPARSE_IMAGE_HEADER_SIZE]);

impl SparseImageHeader {
    /// Checks whether `data` starts with a recognized sparse image
    /// signature. A plain extent file fails this check by construction.
    pub fn has_signature(data: &[u8]) -> bool {
        data.len() >= 16
            && (&data[..16] == SPARSE_IMAGE_SIGNATURE || &data[..16] == SPARSE_IMAGE_SIGNATURE_EXTENDED)
    }

    /// Parses and validates the first 64 bytes of a sparse image file.
    ///
    /// The caller is expected to have checked `has_signature` first; a
    /// signature mismatch here is an `InvalidFormat` error rather than a
    /// "try plain" signal.
    pub fn parse(data: &[u8]) -> Result<SparseImageHeader> {
        let header_data = data.get(..SPARSE_IMAGE_HEADER_SIZE).ok_or_else(|| {
            PhdError::InvalidFormat("short read of sparse image header".to_string())
        })?;
        let header = LayoutVerified::<&[u8], SparseImageHeader>::new(header_data)
            .ok_or_else(|| PhdError::InvalidFormat("unable to parse sparse image header".to_string()))?
            .into_ref()
            .clone();

        if !Self::has_signature(&header.signature) {
            return Err(PhdError::InvalidFormat("unknown sparse image signature".to_string()));
        }
        if header.format_version.get() != SPARSE_IMAGE_FORMAT_VERSION {
            return Err(PhdError::Unsupported(format!(
                "sparse image format version: 0x{:08x}",
                header.format_version.get()
            )));
        }
        if header.block_size_in_sectors.get() as u64 != BLOCK_SIZE_IN_SECTORS {
            return Err(PhdError::Unsupported(format!(
                "sparse image block size: {} sectors",
                header.block_size_in_sectors.get()
            )));
        }
        let number_of_entries = header.number_of_allocation_table_entries.get();
        if number_of_entries == 0 {
            return Err(PhdError::InvalidFormat(
                "sparse image allocation table is empty".to_string(),
            ));
        }
        if number_of_entries as usize > MAXIMUM_ALLOCATION_TABLE_SIZE / 4 {
            return Err(PhdError::InvalidFormat(format!(
                "sparse image allocation table entries out of bounds: {}",
                number_of_entries
            )));
        }
        match header.disk_type.get() {
            SPARSE_IMAGE_DISK_TYPE_FIXED | SPARSE_IMAGE_DISK_TYPE_DYNAMIC => {}
            other => {
                return Err(PhdError::Unsupported(format!("sparse image disk type: {}", other)))
            }
        }
        Ok(header)
    }

    /// Block size in bytes; 1 MiB for a valid header.
    pub fn block_size(&self) -> u64 {
        self.block_size_in_sectors.get() as u64 * SECTOR_SIZE
    }

    /// Logical size of the image in bytes.
    pub fn media_size(&self) -> u64 {
        self.number_of_sectors.get() * SECTOR_SIZE
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Encodes a well-formed sparse image header for tests.
    pub fn encode_header(
        signature: &[u8; 16],
        format_version: u32,
        number_of_entries: u32,
        number_of_sectors: u64,
        disk_type: u32,
    ) -> [u8; SPARSE_IMAGE_HEADER_SIZE] {
        let mut data = [0u8; SPARSE_IMAGE_HEADER_SIZE];
        data[0..16].copy_from_slice(signature);
        data[16..20].copy_from_slice(&format_version.to_be_bytes());
        data[20..24].copy_from_slice(&16u32.to_be_bytes());
        data[24..28].copy_from_slice(&8u32.to_be_bytes());
        data[28..32].copy_from_slice(&(BLOCK_SIZE_IN_SECTORS as u32).to_be_bytes());
        data[32..36].copy_from_slice(&number_of_entries.to_be_bytes());
        data[36..44].copy_from_slice(&number_of_sectors.to_be_bytes());
        data[56..60].copy_from_slice(&disk_type.to_be_bytes());
        data
    }
}
