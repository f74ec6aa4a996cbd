// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Offset-to-block lookup for one sparse image.
//!
//! Each allocated 1-MiB block of a sparse image is described by a
//! `BlockDescriptor`; the `BlockTree` maps a logical offset within the
//! image to the descriptor of its containing block. Blocks are fixed-size,
//! so the tree is a flat leaf vector indexed by `offset / block_size`:
//! constant-time lookup, no pointer chasing, no locking once built.

use {
    crate::error::{PhdError, Result},
    std::convert::TryInto,
};

/// Location of one allocated block inside an extent file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Pool entry of the extent file holding the block.
    pub file_io_pool_entry: usize,
    /// Byte offset of the block data within that file.
    pub file_offset: u64,
}

/// Outcome of inserting a descriptor at a logical offset.
#[derive(Debug, PartialEq)]
pub enum BlockTreeInsert {
    Inserted { leaf_index: usize },
    /// A descriptor was already present at this offset; it is kept and the
    /// new one is dropped.
    AlreadyPresent { leaf_index: usize, existing: BlockDescriptor },
}

#[derive(Debug)]
pub struct BlockTree {
    logical_size: u64,
    leaf_value_size: u64,
    leaves: Vec<Option<BlockDescriptor>>,
}

impl BlockTree {
    pub fn new(logical_size: u64, leaf_value_size: u64) -> Result<Self> {
        if logical_size == 0 {
            return Err(PhdError::InvalidArgument("logical size is zero"));
        }
        if leaf_value_size == 0 {
            return Err(PhdError::InvalidArgument("leaf value size is zero"));
        }
        let number_of_leaves = (logical_size + leaf_value_size - 1) / leaf_value_size;
        let number_of_leaves: usize = number_of_leaves
            .try_into()
            .map_err(|_| PhdError::OutOfMemory("block tree leaf count"))?;
        Ok(BlockTree { logical_size, leaf_value_size, leaves: vec![None; number_of_leaves] })
    }

    /// Inserts `descriptor` for the block containing `logical_offset`.
    /// An existing descriptor at that offset is left unchanged.
    pub fn insert(
        &mut self,
        logical_offset: u64,
        descriptor: BlockDescriptor,
    ) -> Result<BlockTreeInsert> {
        let leaf_index = self.leaf_index(logical_offset)?;
        match self.leaves[leaf_index] {
            Some(existing) => Ok(BlockTreeInsert::AlreadyPresent { leaf_index, existing }),
            None => {
                self.leaves[leaf_index] = Some(descriptor);
                Ok(BlockTreeInsert::Inserted { leaf_index })
            }
        }
    }

    /// Returns the descriptor of the block containing `logical_offset`
    /// (`None` for a sparse hole) and the offset within that block.
    pub fn lookup(&self, logical_offset: u64) -> Result<(Option<&BlockDescriptor>, u64)> {
        let leaf_index = self.leaf_index(logical_offset)?;
        let block_offset = logical_offset % self.leaf_value_size;
        Ok((self.leaves[leaf_index].as_ref(), block_offset))
    }

    fn leaf_index(&self, logical_offset: u64) -> Result<usize> {
        if logical_offset >= self.logical_size {
            return Err(PhdError::InvalidArgument("logical offset out of bounds"));
        }
        Ok((logical_offset / self.leaf_value_size) as usize)
    }
}
