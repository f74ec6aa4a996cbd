// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Read-only access to Parallels Hard Disk (PHD) images.
//!
//! A PHD image is a directory holding a `DiskDescriptor.xml` descriptor
//! and one data file per extent. Extent files are either plain (raw
//! bytes) or sparse "compressed" images, whose allocation table maps
//! 1-MiB blocks to positions in the file; unallocated blocks read as
//! zeros. This crate exposes the image as one contiguous byte-addressable
//! volume:
//!
//! ```no_run
//! use phd_read_only::{AccessFlags, Handle};
//!
//! # fn main() -> Result<(), phd_read_only::PhdError> {
//! let handle = Handle::new();
//! handle.open("/images/machine.hdd", AccessFlags::READ)?;
//! handle.open_extent_data_files()?;
//! let mut buffer = vec![0u8; 4096];
//! let count = handle.read_buffer_at_offset(&mut buffer, 0)?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```
//!
//! Reads may be issued concurrently from multiple threads; open extent
//! files and decoded sparse images are both held in bounded pools.
//! Writing, snapshot resolution and differential images are out of scope.

#[macro_use]
extern crate static_assertions;

mod block_tree;
mod data_files;
mod descriptor;
mod disk_parameters;
mod error;
mod extent_table;
mod extent_values;
mod file_io_pool;
mod guid;
mod handle;
mod readers;
mod snapshot_values;
mod storage_image;
mod structs;
mod xml;

pub use crate::{
    data_files::EncodingContext,
    descriptor::DiskType,
    disk_parameters::DiskParameters,
    error::{PhdError, Result},
    extent_values::{ExtentType, ExtentValues, ImageType, ImageValues},
    file_io_pool::FileIoPool,
    guid::Guid,
    handle::{AccessFlags, Handle, DESCRIPTOR_FILENAME},
    readers::{FileReader, Reader, ReaderError, VecReader},
    snapshot_values::SnapshotValues,
};
