// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory decoding state for one sparse extent file.
//!
//! A `StorageImage` binds the file's header to its block allocation table:
//! each 32-bit little-endian BAT entry holds the sector offset of one
//! 1-MiB block within the same file, or zero for a sparse hole.

use {
    crate::{
        block_tree::{BlockDescriptor, BlockTree, BlockTreeInsert},
        error::{PhdError, Result},
        file_io_pool::FileIoPool,
        structs::{SparseImageHeader, SECTOR_SIZE, SPARSE_IMAGE_HEADER_SIZE},
    },
    byteorder::{ByteOrder, LittleEndian},
    log::debug,
};

pub struct StorageImage {
    header: Option<SparseImageHeader>,
    block_tree: Option<BlockTree>,
}

impl StorageImage {
    pub fn new() -> Self {
        StorageImage { header: None, block_tree: None }
    }

    /// Reads and parses the file header through the pool.
    ///
    /// Returns `false` when the file does not carry a sparse image
    /// signature, leaving the image unchanged so the caller can decide how
    /// to treat a plain file.
    pub fn read_file_header(&mut self, pool: &FileIoPool, pool_entry: usize) -> Result<bool> {
        if self.header.is_some() {
            return Err(PhdError::AlreadySet("storage image header"));
        }
        let mut data = [0u8; SPARSE_IMAGE_HEADER_SIZE];
        pool.read_at(pool_entry, 0, &mut data).map_err(|error| match error {
            PhdError::Io(ref io_error) if io_error.kind() == std::io::ErrorKind::UnexpectedEof => {
                PhdError::InvalidFormat("short read of sparse image header".to_string())
            }
            other => other,
        })?;
        if !SparseImageHeader::has_signature(&data) {
            return Ok(false);
        }
        self.header = Some(SparseImageHeader::parse(&data)?);
        Ok(true)
    }

    /// Reads the block allocation table that follows the header and builds
    /// the block tree. Duplicate entries mapping the same logical block
    /// keep the first descriptor.
    pub fn read_block_allocation_table(
        &mut self,
        pool: &FileIoPool,
        pool_entry: usize,
    ) -> Result<()> {
        let header = self.header.as_ref().ok_or(PhdError::Missing("storage image header"))?;
        if self.block_tree.is_some() {
            return Err(PhdError::AlreadySet("storage image block tree"));
        }
        let number_of_entries = header.number_of_allocation_table_entries.get() as usize;
        let block_size = header.block_size();

        let mut table_data = vec![0u8; number_of_entries * 4];
        pool.read_at(pool_entry, SPARSE_IMAGE_HEADER_SIZE as u64, &mut table_data)?;

        let mut block_tree = BlockTree::new(header.media_size(), block_size)?;
        let mut logical_offset = 0u64;
        for entry_data in table_data.chunks_exact(4) {
            let table_entry = LittleEndian::read_u32(entry_data);
            if table_entry != 0 {
                let descriptor = BlockDescriptor {
                    file_io_pool_entry: pool_entry,
                    file_offset: table_entry as u64 * SECTOR_SIZE,
                };
                if let BlockTreeInsert::AlreadyPresent { leaf_index, .. } =
                    block_tree.insert(logical_offset, descriptor)?
                {
                    debug!(
                        "storage image: duplicate allocation table entry for block {}",
                        leaf_index
                    );
                }
            }
            logical_offset += block_size;
        }
        self.block_tree = Some(block_tree);
        Ok(())
    }

    /// Resolves an offset within this image to its block descriptor
    /// (`None` for a sparse hole) and the offset within the block.
    pub fn lookup(&self, data_offset: u64) -> Result<(Option<&BlockDescriptor>, u64)> {
        let block_tree =
            self.block_tree.as_ref().ok_or(PhdError::Missing("storage image block tree"))?;
        block_tree.lookup(data_offset)
    }

    pub fn block_size(&self) -> Result<u64> {
        let header = self.header.as_ref().ok_or(PhdError::Missing("storage image header"))?;
        Ok(header.block_size())
    }

    /// Logical size of the image in bytes, from the header's sector count.
    pub fn media_size(&self) -> Result<u64> {
        let header = self.header.as_ref().ok_or(PhdError::Missing("storage image header"))?;
        Ok(header.media_size())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::structs::{
            test_util::encode_header, SPARSE_IMAGE_DISK_TYPE_DYNAMIC, SPARSE_IMAGE_FORMAT_VERSION,
            SPARSE_IMAGE_SIGNATURE,
        },
        matches::assert_matches,
        std::io::Write,
        tempfile::tempdir,
    };

    const BLOCK_SIZE: u64 = 1024 * 1024;

    /// Lays out a sparse image file: header, BAT, then data blocks.
    fn sparse_image_pool(table: &[u32], number_of_sectors: u64) -> (tempfile::TempDir, FileIoPool) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("image.hds");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(&encode_header(
            SPARSE_IMAGE_SIGNATURE,
            SPARSE_IMAGE_FORMAT_VERSION,
            table.len() as u32,
            number_of_sectors,
            SPARSE_IMAGE_DISK_TYPE_DYNAMIC,
        ))
        .expect("header");
        for entry in table {
            file.write_all(&entry.to_le_bytes()).expect("table");
        }
        let data_size = table.iter().map(|&e| e as u64 * SECTOR_SIZE).max().unwrap_or(0)
            + if table.iter().any(|&e| e != 0) { BLOCK_SIZE } else { 0 };
        file.set_len(data_size.max(SPARSE_IMAGE_HEADER_SIZE as u64 + table.len() as u64 * 4))
            .expect("set_len");
        drop(file);

        let pool = FileIoPool::new(0);
        pool.append_path(path).expect("append");
        (dir, pool)
    }

    #[test]
    fn header_then_table_builds_block_tree() {
        // Two allocated blocks, two holes, matching the 4-entry layout.
        let (_dir, pool) = sparse_image_pool(&[0x40, 0, 0x840, 0], 8192);
        let mut image = StorageImage::new();
        assert!(image.read_file_header(&pool, 0).expect("header"));
        image.read_block_allocation_table(&pool, 0).expect("table");

        assert_eq!(image.block_size().unwrap(), BLOCK_SIZE);
        assert_eq!(image.media_size().unwrap(), 8192 * 512);

        let (descriptor, block_offset) = image.lookup(10).expect("lookup");
        assert_eq!(
            descriptor,
            Some(&BlockDescriptor { file_io_pool_entry: 0, file_offset: 0x40 * 512 })
        );
        assert_eq!(block_offset, 10);

        let (hole, _) = image.lookup(BLOCK_SIZE).expect("lookup");
        assert_eq!(hole, None);

        let (descriptor, _) = image.lookup(2 * BLOCK_SIZE).expect("lookup");
        assert_eq!(
            descriptor,
            Some(&BlockDescriptor { file_io_pool_entry: 0, file_offset: 0x840 * 512 })
        );
    }

    #[test]
    fn plain_file_is_not_a_sparse_image() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("plain.hdd");
        std::fs::write(&path, vec![0xaa; 4096]).expect("write");
        let pool = FileIoPool::new(0);
        pool.append_path(path).expect("append");

        let mut image = StorageImage::new();
        assert!(!image.read_file_header(&pool, 0).expect("header"));
        assert_matches!(image.block_size(), Err(PhdError::Missing(_)));
    }

    #[test]
    fn table_requires_header() {
        let (_dir, pool) = sparse_image_pool(&[0x40], 2048);
        let mut image = StorageImage::new();
        assert_matches!(
            image.read_block_allocation_table(&pool, 0),
            Err(PhdError::Missing(_))
        );
    }

    #[test]
    fn rereading_header_is_rejected() {
        let (_dir, pool) = sparse_image_pool(&[0x40], 2048);
        let mut image = StorageImage::new();
        image.read_file_header(&pool, 0).expect("header");
        assert_matches!(image.read_file_header(&pool, 0), Err(PhdError::AlreadySet(_)));
    }
}
