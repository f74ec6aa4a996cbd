// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-disk routing from logical volume offsets to extent file data.
//!
//! A fixed disk is an end-to-end concatenation of plain file ranges and is
//! served by an ordered segment list. An expanding disk is a list of
//! sparse images, each loaded lazily into a bounded cache of decoded
//! `StorageImage`s. Initialization is two-phase: the extent count and disk
//! type first, then one `set_extent` call per extent once the file sizes
//! are known.

use {
    crate::{
        data_files::{extent_data_file_path, EncodingContext},
        descriptor::DiskType,
        error::{PhdError, Result},
        extent_values::{ImageType, ImageValues},
        file_io_pool::FileIoPool,
        storage_image::StorageImage,
    },
    log::debug,
    parking_lot::Mutex,
    std::{
        cmp::Ordering,
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering as AtomicOrdering},
            Arc,
        },
    },
};

/// Bound on simultaneously decoded sparse images.
pub(crate) const MAXIMUM_CACHE_ENTRIES_EXTENT_FILES: usize = 8;

/// One plain file range of a fixed disk.
struct Segment {
    logical_offset: u64,
    size: u64,
    file_io_pool_entry: usize,
    file_offset: u64,
}

/// One sparse image of an expanding disk.
struct ExtentFile {
    logical_offset: u64,
    logical_size: u64,
    file_size: u64,
    file_io_pool_entry: usize,
}

#[derive(Default)]
struct StorageImageCache {
    slots: HashMap<usize, CacheSlot>,
    use_counter: u64,
}

struct CacheSlot {
    image: Arc<StorageImage>,
    last_use: u64,
}

impl StorageImageCache {
    fn get(&mut self, extent_index: usize) -> Option<Arc<StorageImage>> {
        self.use_counter += 1;
        let use_counter = self.use_counter;
        self.slots.get_mut(&extent_index).map(|slot| {
            slot.last_use = use_counter;
            Arc::clone(&slot.image)
        })
    }

    /// Inserts an image, evicting the least-recently-used slot beyond
    /// `capacity`. Returns the resident image, which is the previously
    /// cached one when another reader won the race to fill the slot.
    fn insert(
        &mut self,
        extent_index: usize,
        image: Arc<StorageImage>,
        capacity: usize,
    ) -> Arc<StorageImage> {
        if let Some(existing) = self.get(extent_index) {
            return existing;
        }
        self.use_counter += 1;
        self.slots
            .insert(extent_index, CacheSlot { image: Arc::clone(&image), last_use: self.use_counter });
        while self.slots.len() > capacity {
            let evicted = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_use)
                .map(|(&index, _)| index)
                .unwrap();
            debug!("storage image cache: evicting extent {}", evicted);
            self.slots.remove(&evicted);
        }
        image
    }
}

pub struct ExtentTable {
    disk_type: Option<DiskType>,
    image_type: Option<ImageType>,
    data_files_path: Option<PathBuf>,
    encoding: EncodingContext,
    segments: Vec<Segment>,
    extent_files: Vec<ExtentFile>,
    cache: Mutex<StorageImageCache>,
}

impl ExtentTable {
    pub fn new(encoding: EncodingContext) -> Self {
        ExtentTable {
            disk_type: None,
            image_type: None,
            data_files_path: None,
            encoding,
            segments: Vec::new(),
            extent_files: Vec::new(),
            cache: Mutex::new(StorageImageCache::default()),
        }
    }

    pub fn data_files_path(&self) -> Option<&Path> {
        self.data_files_path.as_deref()
    }

    pub fn set_data_files_path(&mut self, path: PathBuf) {
        self.data_files_path = Some(path);
    }

    /// Resolves the on-disk path of an extent's data file.
    pub fn extent_data_file_path(&self, image: &ImageValues) -> PathBuf {
        extent_data_file_path(self.data_files_path(), image.filename(), self.encoding)
    }

    /// First initialization phase: reserves room for `number_of_extents`
    /// extents and pins the disk type.
    pub fn initialize_extents(
        &mut self,
        number_of_extents: usize,
        disk_type: DiskType,
    ) -> Result<()> {
        if self.disk_type.is_some() {
            return Err(PhdError::AlreadySet("extent table extents"));
        }
        if number_of_extents == 0 {
            return Err(PhdError::InvalidArgument("number of extents is zero"));
        }
        match disk_type {
            DiskType::Fixed => self.segments.reserve(number_of_extents),
            DiskType::Expanding => self.extent_files.reserve(number_of_extents),
        }
        self.disk_type = Some(disk_type);
        Ok(())
    }

    /// Second initialization phase: appends one extent. Extents must be
    /// appended in extent order; the first call pins the image type.
    pub fn set_extent(
        &mut self,
        file_io_pool_entry: usize,
        extent_file_size: u64,
        extent_offset: i64,
        extent_size: u64,
        image_type: ImageType,
    ) -> Result<()> {
        let disk_type = self.disk_type.ok_or(PhdError::Missing("extent table extents"))?;
        match self.image_type {
            None => {
                let supported = match image_type {
                    ImageType::Plain => disk_type == DiskType::Fixed,
                    ImageType::Compressed => disk_type == DiskType::Expanding,
                    ImageType::Unknown => {
                        return Err(PhdError::Unsupported("image type".to_string()))
                    }
                };
                if !supported {
                    return Err(PhdError::Unsupported(format!(
                        "image type {} for {:?} disk",
                        image_type, disk_type
                    )));
                }
                self.image_type = Some(image_type);
            }
            Some(pinned) if pinned != image_type => {
                return Err(PhdError::Unsupported("mixed image types".to_string()))
            }
            Some(_) => {}
        }
        match image_type {
            ImageType::Plain => {
                if extent_offset < 0 || extent_offset as u64 >= extent_file_size {
                    return Err(PhdError::InvalidFormat(format!(
                        "extent offset {} out of bounds of file size {}",
                        extent_offset, extent_file_size
                    )));
                }
                if extent_size > extent_file_size - extent_offset as u64 {
                    return Err(PhdError::InvalidFormat(format!(
                        "extent size {} out of bounds of file size {}",
                        extent_size, extent_file_size
                    )));
                }
                let logical_offset =
                    self.segments.iter().map(|segment| segment.size).sum::<u64>();
                self.segments.push(Segment {
                    logical_offset,
                    size: extent_size,
                    file_io_pool_entry,
                    file_offset: extent_offset as u64,
                });
            }
            ImageType::Compressed => {
                // A sparse image always covers its whole file.
                if extent_offset != 0 {
                    return Err(PhdError::InvalidFormat(format!(
                        "extent offset {} for sparse image",
                        extent_offset
                    )));
                }
                let logical_offset =
                    self.extent_files.iter().map(|extent| extent.logical_size).sum::<u64>();
                self.extent_files.push(ExtentFile {
                    logical_offset,
                    logical_size: extent_size,
                    file_size: extent_file_size,
                    file_io_pool_entry,
                });
            }
            ImageType::Unknown => unreachable!("rejected above"),
        }
        Ok(())
    }

    /// Total number of logical bytes the table can route.
    pub fn mapped_size(&self) -> u64 {
        match self.disk_type {
            Some(DiskType::Fixed) => self.segments.iter().map(|segment| segment.size).sum(),
            Some(DiskType::Expanding) => {
                self.extent_files.iter().map(|extent| extent.logical_size).sum()
            }
            None => 0,
        }
    }

    /// Resolves a logical offset of an expanding disk to its extent index,
    /// the offset within that extent, and the decoded sparse image.
    ///
    /// On a cache miss the image's header and allocation table are read
    /// through the pool; the returned `Arc` stays valid when a later
    /// lookup evicts the cache slot.
    pub fn get_extent_file_at_offset(
        &self,
        offset: u64,
        pool: &FileIoPool,
    ) -> Result<(usize, u64, Arc<StorageImage>)> {
        if self.disk_type != Some(DiskType::Expanding) {
            return Err(PhdError::InvalidArgument("not an expanding disk"));
        }
        let extent_index = self
            .extent_files
            .binary_search_by(|extent| {
                if offset < extent.logical_offset {
                    Ordering::Greater
                } else if offset >= extent.logical_offset + extent.logical_size {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .map_err(|_| PhdError::NotFound(format!("no extent at offset {}", offset)))?;
        let extent = &self.extent_files[extent_index];
        let extent_file_data_offset = offset - extent.logical_offset;

        if let Some(image) = self.cache.lock().get(extent_index) {
            return Ok((extent_index, extent_file_data_offset, image));
        }
        debug!(
            "decoding storage image for extent {} ({} byte file)",
            extent_index, extent.file_size
        );
        // Decode outside the cache lock so a slow read of one extent does
        // not stall lookups of the others.
        let image = Arc::new(self.read_storage_image(pool, extent.file_io_pool_entry)?);
        let image =
            self.cache.lock().insert(extent_index, image, MAXIMUM_CACHE_ENTRIES_EXTENT_FILES);
        Ok((extent_index, extent_file_data_offset, image))
    }

    /// Reads and decodes the sparse image backing `file_io_pool_entry`.
    pub fn read_storage_image(
        &self,
        pool: &FileIoPool,
        file_io_pool_entry: usize,
    ) -> Result<StorageImage> {
        let mut image = StorageImage::new();
        if !image.read_file_header(pool, file_io_pool_entry)? {
            return Err(PhdError::InvalidFormat(format!(
                "extent file in pool entry {} is not a sparse image",
                file_io_pool_entry
            )));
        }
        image.read_block_allocation_table(pool, file_io_pool_entry)?;
        debug!(
            "decoded sparse image in pool entry {}: {} logical bytes",
            file_io_pool_entry,
            image.media_size()?
        );
        Ok(image)
    }

    /// Reads from the segment stream of a fixed disk, starting at
    /// `offset`. Returns the number of bytes read, short only at the end
    /// of the stream or on abort.
    pub fn read_segments_at_offset(
        &self,
        pool: &FileIoPool,
        offset: u64,
        buffer: &mut [u8],
        abort: &AtomicBool,
    ) -> Result<usize> {
        if self.disk_type != Some(DiskType::Fixed) {
            return Err(PhdError::InvalidArgument("not a fixed disk"));
        }
        let stream_size = self.mapped_size();
        let mut bytes_read = 0usize;
        while bytes_read < buffer.len() {
            let stream_offset = offset + bytes_read as u64;
            if stream_offset >= stream_size {
                break;
            }
            let segment_index = self
                .segments
                .binary_search_by(|segment| {
                    if stream_offset < segment.logical_offset {
                        Ordering::Greater
                    } else if stream_offset >= segment.logical_offset + segment.size {
                        Ordering::Less
                    } else {
                        Ordering::Equal
                    }
                })
                .map_err(|_| {
                    PhdError::NotFound(format!("no extent segment at offset {}", stream_offset))
                })?;
            let segment = &self.segments[segment_index];
            let segment_data_offset = stream_offset - segment.logical_offset;
            let read_size = std::cmp::min(
                (segment.size - segment_data_offset) as usize,
                buffer.len() - bytes_read,
            );
            pool.read_at(
                segment.file_io_pool_entry,
                segment.file_offset + segment_data_offset,
                &mut buffer[bytes_read..bytes_read + read_size],
            )?;
            bytes_read += read_size;
            if abort.load(AtomicOrdering::Relaxed) {
                break;
            }
        }
        Ok(bytes_read)
    }
}
