// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Public handle over one disk image.
//!
//! Opening is two-step: `open` (or `open_reader`) parses the descriptor,
//! then `open_extent_data_files` locates and opens the extent files and
//! builds the routing table. Reads may then be issued from any thread; the
//! handle serializes them through one read/write lock and routes each byte
//! to a plain extent range, an allocated sparse block or a zero-filled
//! hole.

use {
    crate::{
        data_files::EncodingContext,
        descriptor::{DiskDescriptor, DiskType},
        disk_parameters::DiskParameters,
        error::{PhdError, Result},
        extent_table::ExtentTable,
        extent_values::{ExtentValues, ImageType},
        file_io_pool::FileIoPool,
        guid::Guid,
        readers::Reader,
        snapshot_values::SnapshotValues,
    },
    bitflags::bitflags,
    log::debug,
    parking_lot::RwLock,
    std::{
        cmp::min,
        convert::TryInto,
        fs,
        io::{self, SeekFrom},
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, Ordering},
    },
};

/// Name of the descriptor file inside an image directory.
pub const DESCRIPTOR_FILENAME: &str = "DiskDescriptor.xml";

bitflags! {
    pub struct AccessFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

#[derive(Default)]
struct HandleState {
    disk_parameters: Option<DiskParameters>,
    disk_type: Option<DiskType>,
    extent_values: Vec<ExtentValues>,
    snapshot_values: Vec<SnapshotValues>,
    extent_table: Option<ExtentTable>,
    file_io_pool: Option<FileIoPool>,
    extent_data_files_open: bool,
    current_offset: i64,
    maximum_number_of_open_handles: usize,
    encoding: EncodingContext,
}

/// Read-only handle over a Parallels Hard Disk image.
pub struct Handle {
    state: RwLock<HandleState>,
    abort: AtomicBool,
}

impl Default for Handle {
    fn default() -> Self {
        Handle::new()
    }
}

impl Handle {
    pub fn new() -> Self {
        Handle::with_encoding(EncodingContext::default())
    }

    /// Creates a handle with an explicit filename encoding context.
    pub fn with_encoding(encoding: EncodingContext) -> Self {
        let state = HandleState { encoding, ..HandleState::default() };
        Handle { state: RwLock::new(state), abort: AtomicBool::new(false) }
    }

    /// Opens a disk image from `filename`: either the image directory or
    /// the descriptor file itself. The directory containing the descriptor
    /// becomes the data-files path for locating extent files.
    pub fn open(&self, filename: impl AsRef<Path>, access_flags: AccessFlags) -> Result<()> {
        check_access_flags(access_flags)?;
        let filename = filename.as_ref();
        let descriptor_path = if fs::metadata(filename)?.is_dir() {
            filename.join(DESCRIPTOR_FILENAME)
        } else {
            filename.to_path_buf()
        };
        let data = fs::read(&descriptor_path)?;
        let data_files_path = match descriptor_path.parent() {
            Some(parent) if parent != Path::new("") => Some(parent.to_path_buf()),
            _ => None,
        };
        debug!("opening disk descriptor {}", descriptor_path.display());
        self.open_descriptor_data(&data, data_files_path)
    }

    /// Opens a disk image from a caller-supplied descriptor byte stream.
    /// No data-files path is implied; set one with
    /// `set_extent_data_files_path` before opening the extent files.
    pub fn open_reader(&self, reader: &dyn Reader, access_flags: AccessFlags) -> Result<()> {
        check_access_flags(access_flags)?;
        let size = reader.size()?;
        let size: usize = size
            .try_into()
            .map_err(|_| PhdError::OutOfMemory("descriptor size"))?;
        let mut data = vec![0u8; size];
        reader.read(0, &mut data)?;
        self.open_descriptor_data(&data, None)
    }

    fn open_descriptor_data(&self, data: &[u8], data_files_path: Option<PathBuf>) -> Result<()> {
        let mut state = self.state.write();
        if state.disk_parameters.is_some() {
            return Err(PhdError::AlreadyOpen);
        }
        let descriptor = DiskDescriptor::parse(data)?;
        let mut extent_table = ExtentTable::new(state.encoding);
        if let Some(path) = data_files_path {
            extent_table.set_data_files_path(path);
        }
        state.disk_parameters = Some(descriptor.disk_parameters);
        state.disk_type = Some(descriptor.disk_type);
        state.extent_values = descriptor.extents;
        state.snapshot_values = descriptor.snapshots;
        state.extent_table = Some(extent_table);
        state.current_offset = 0;
        self.abort.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Locates, opens and decodes every extent data file named by the
    /// descriptor. Pool entry `i` holds extent `i`'s file.
    pub fn open_extent_data_files(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        if state.extent_data_files_open {
            return Err(PhdError::AlreadySet("extent data files"));
        }
        let pool = FileIoPool::new(state.maximum_number_of_open_handles);
        let extent_table = state.extent_table.as_ref().unwrap();
        for extent in &state.extent_values {
            let image = extent.first_image();
            if image.image_type() == ImageType::Unknown {
                return Err(PhdError::Unsupported("image type".to_string()));
            }
            // A failure here drops the pool and with it every file opened
            // so far; no partially-opened state is left behind.
            let path = extent_table.extent_data_file_path(image);
            pool.append_path(path)?;
        }
        self.open_read_extent_data_files(&mut state, pool)
    }

    /// Same as `open_extent_data_files` over a caller-supplied pool, whose
    /// entry `i` must already hold extent `i`'s file.
    pub fn open_extent_data_files_pool(&self, pool: FileIoPool) -> Result<()> {
        let mut state = self.state.write();
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        if state.extent_data_files_open {
            return Err(PhdError::AlreadySet("extent data files"));
        }
        if pool.number_of_entries() != state.extent_values.len() {
            return Err(PhdError::Missing("file IO pool entries for every extent"));
        }
        self.open_read_extent_data_files(&mut state, pool)
    }

    fn open_read_extent_data_files(
        &self,
        state: &mut HandleState,
        pool: FileIoPool,
    ) -> Result<()> {
        let disk_type = state.disk_type.unwrap();
        let number_of_extents = state.extent_values.len();
        let extent_table = state.extent_table.as_mut().unwrap();
        extent_table.initialize_extents(number_of_extents, disk_type)?;
        for (extent_index, extent) in state.extent_values.iter().enumerate() {
            let extent_file_size = pool.entry_size(extent_index)?;
            let image_type = extent.first_image().image_type();
            extent_table.set_extent(
                extent_index,
                extent_file_size,
                extent.offset(),
                extent.size(),
                image_type,
            )?;
            if image_type == ImageType::Compressed {
                // Decode once now so a malformed sparse image fails the
                // open instead of the first read; the cache re-reads it
                // on demand.
                extent_table.read_storage_image(&pool, extent_index)?;
            }
            if self.abort.load(Ordering::Relaxed) {
                return Err(PhdError::Io(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "open aborted",
                )));
            }
        }
        state.file_io_pool = Some(pool);
        state.extent_data_files_open = true;
        Ok(())
    }

    /// Closes the handle and releases every resource it holds. Calling
    /// `close` on a closed handle is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if let Some(pool) = state.file_io_pool.take() {
            pool.close_all();
        }
        state.extent_table = None;
        state.disk_parameters = None;
        state.disk_type = None;
        state.extent_values.clear();
        state.snapshot_values.clear();
        state.extent_data_files_open = false;
        state.current_offset = 0;
        self.abort.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Reads up to `buffer.len()` bytes at the current offset and advances
    /// it. Returns the byte count, which is short at the end of the volume
    /// or when the read is aborted; a read at or past the end returns 0.
    pub fn read_buffer(&self, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.write();
        self.read_buffer_from_pool(&mut state, buffer)
    }

    /// Seeks to `offset`, then reads. The current offset lands at
    /// `offset + returned`.
    pub fn read_buffer_at_offset(&self, buffer: &mut [u8], offset: i64) -> Result<usize> {
        let mut state = self.state.write();
        if offset < 0 {
            return Err(PhdError::InvalidArgument("offset is negative"));
        }
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        state.current_offset = offset;
        self.read_buffer_from_pool(&mut state, buffer)
    }

    fn read_buffer_from_pool(&self, state: &mut HandleState, buffer: &mut [u8]) -> Result<usize> {
        let media_size = match &state.disk_parameters {
            Some(parameters) => parameters.media_size(),
            None => return Err(PhdError::Missing("disk descriptor")),
        };
        if !state.extent_data_files_open {
            return Err(PhdError::Missing("extent data files"));
        }
        // A new read starts with a clear abort flag; `signal_abort` only
        // cuts the read in flight.
        self.abort.store(false, Ordering::Relaxed);

        let current_offset = state.current_offset as u64;
        if current_offset >= media_size {
            return Ok(0);
        }
        let read_size = min(buffer.len() as u64, media_size - current_offset) as usize;
        let pool = state.file_io_pool.as_ref().unwrap();
        let extent_table = state.extent_table.as_ref().unwrap();

        let bytes_read = match state.disk_type.unwrap() {
            DiskType::Fixed => extent_table.read_segments_at_offset(
                pool,
                current_offset,
                &mut buffer[..read_size],
                &self.abort,
            )?,
            DiskType::Expanding => {
                let mut bytes_read = 0usize;
                while bytes_read < read_size {
                    let offset = current_offset + bytes_read as u64;
                    let (_extent_index, extent_data_offset, image) =
                        extent_table.get_extent_file_at_offset(offset, pool)?;
                    let block_size = image.block_size()?;
                    let (descriptor, block_offset) = image.lookup(extent_data_offset)?;
                    let chunk_size =
                        min((block_size - block_offset) as usize, read_size - bytes_read);
                    let chunk = &mut buffer[bytes_read..bytes_read + chunk_size];
                    match descriptor {
                        // Sparse hole: the block has no backing data.
                        None => chunk.iter_mut().for_each(|byte| *byte = 0),
                        Some(descriptor) => pool.read_at(
                            descriptor.file_io_pool_entry,
                            descriptor.file_offset + block_offset,
                            chunk,
                        )?,
                    }
                    bytes_read += chunk_size;
                    if self.abort.load(Ordering::Relaxed) {
                        break;
                    }
                }
                bytes_read
            }
        };
        state.current_offset += bytes_read as i64;
        Ok(bytes_read)
    }

    /// Moves the current offset. Seeking past the end of the volume is
    /// allowed; later reads there return 0. Returns the new offset.
    pub fn seek_offset(&self, position: SeekFrom) -> Result<i64> {
        let mut state = self.state.write();
        let media_size = match &state.disk_parameters {
            Some(parameters) => parameters.media_size(),
            None => return Err(PhdError::Missing("disk descriptor")),
        };
        let target: i128 = match position {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => state.current_offset as i128 + delta as i128,
            SeekFrom::End(delta) => media_size as i128 + delta as i128,
        };
        if target < 0 || target > i64::MAX as i128 {
            return Err(PhdError::InvalidArgument("seek offset out of bounds"));
        }
        state.current_offset = target as i64;
        Ok(state.current_offset)
    }

    pub fn offset(&self) -> Result<i64> {
        let state = self.state.read();
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        Ok(state.current_offset)
    }

    /// Requests that an in-flight read stop at its next block boundary.
    /// The read returns the bytes collected so far; this is not an error.
    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn media_size(&self) -> Result<u64> {
        self.with_disk_parameters(|parameters| parameters.media_size())
    }

    /// Returns a copy of the disk parameters, including the geometry
    /// values the descriptor declares.
    pub fn disk_parameters(&self) -> Result<DiskParameters> {
        self.with_disk_parameters(DiskParameters::clone)
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.with_disk_parameters(|parameters| parameters.name().map(str::to_string))
    }

    pub fn identifier(&self) -> Result<Option<Guid>> {
        self.with_disk_parameters(|parameters| parameters.identifier().copied())
    }

    pub fn disk_type(&self) -> Result<DiskType> {
        let state = self.state.read();
        state.disk_type.ok_or(PhdError::Missing("disk descriptor"))
    }

    pub fn number_of_extents(&self) -> Result<usize> {
        let state = self.state.read();
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        Ok(state.extent_values.len())
    }

    /// Returns a copy of extent `extent_index`'s metadata.
    pub fn extent_descriptor(&self, extent_index: usize) -> Result<ExtentValues> {
        let state = self.state.read();
        state
            .extent_values
            .get(extent_index)
            .cloned()
            .ok_or(PhdError::InvalidArgument("extent index out of bounds"))
    }

    pub fn number_of_snapshots(&self) -> Result<usize> {
        let state = self.state.read();
        if state.disk_parameters.is_none() {
            return Err(PhdError::Missing("disk descriptor"));
        }
        Ok(state.snapshot_values.len())
    }

    /// Returns a copy of snapshot `snapshot_index`'s metadata.
    pub fn snapshot(&self, snapshot_index: usize) -> Result<SnapshotValues> {
        let state = self.state.read();
        state
            .snapshot_values
            .get(snapshot_index)
            .cloned()
            .ok_or(PhdError::InvalidArgument("snapshot index out of bounds"))
    }

    /// Caps the number of simultaneously open extent files; 0 means
    /// unlimited. Applies to the current pool and to pools opened later.
    pub fn set_maximum_number_of_open_handles(&self, maximum: usize) -> Result<()> {
        let mut state = self.state.write();
        state.maximum_number_of_open_handles = maximum;
        if let Some(pool) = &state.file_io_pool {
            pool.set_maximum_number_of_open_handles(maximum);
        }
        Ok(())
    }

    /// Overrides the directory the extent data files are located in. Must
    /// be called after `open` and before `open_extent_data_files`.
    pub fn set_extent_data_files_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let mut state = self.state.write();
        if state.extent_data_files_open {
            return Err(PhdError::AlreadySet("extent data files"));
        }
        match state.extent_table.as_mut() {
            Some(extent_table) => {
                extent_table.set_data_files_path(path.into());
                Ok(())
            }
            None => Err(PhdError::Missing("disk descriptor")),
        }
    }

    fn with_disk_parameters<T>(&self, f: impl FnOnce(&DiskParameters) -> T) -> Result<T> {
        let state = self.state.read();
        match &state.disk_parameters {
            Some(parameters) => Ok(f(parameters)),
            None => Err(PhdError::Missing("disk descriptor")),
        }
    }
}

fn check_access_flags(access_flags: AccessFlags) -> Result<()> {
    if access_flags.contains(AccessFlags::WRITE) {
        return Err(PhdError::Unsupported("write access".to_string()));
    }
    if !access_flags.contains(AccessFlags::READ) {
        return Err(PhdError::InvalidArgument("access flags without read"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, matches::assert_matches};

    #[test]
    fn write_access_is_unsupported() {
        let handle = Handle::new();
        assert_matches!(
            handle.open("/nonexistent", AccessFlags::READ | AccessFlags::WRITE),
            Err(PhdError::Unsupported(_))
        );
        assert_matches!(
            handle.open("/nonexistent", AccessFlags::empty()),
            Err(PhdError::InvalidArgument(_))
        );
    }

    #[test]
    fn accessors_require_an_open_handle() {
        let handle = Handle::new();
        assert_matches!(handle.media_size(), Err(PhdError::Missing(_)));
        assert_matches!(handle.offset(), Err(PhdError::Missing(_)));
        assert_matches!(handle.number_of_extents(), Err(PhdError::Missing(_)));
        assert_matches!(handle.seek_offset(SeekFrom::Start(0)), Err(PhdError::Missing(_)));
    }

    #[test]
    fn close_is_idempotent() {
        let handle = Handle::new();
        handle.close().expect("close");
        handle.close().expect("close");
    }
}
