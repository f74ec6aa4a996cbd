// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Projection of the descriptor tag tree into disk metadata.
//!
//! `DiskDescriptor::parse` consumes the raw bytes of `DiskDescriptor.xml`
//! and produces the disk parameters, the ordered extent values, the
//! snapshot values and the overall disk type. All semantic constraints on
//! the descriptor are enforced here, before any extent file is touched.

use {
    crate::{
        disk_parameters::DiskParameters,
        error::{PhdError, Result},
        extent_values::{ExtentType, ExtentValues, ImageType, ImageValues},
        guid::Guid,
        snapshot_values::SnapshotValues,
        structs::{BLOCK_SIZE_IN_SECTORS, SECTOR_SIZE},
        xml::{self, XmlTag},
    },
    log::debug,
    std::convert::TryInto,
};

const ROOT_TAG_NAME: &str = "Parallels_disk_image";
const LOGICAL_SECTOR_SIZE: u64 = SECTOR_SIZE;
const PHYSICAL_SECTOR_SIZE: u64 = 4096;

/// Overall disk layout, inferred from the image types in the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskType {
    /// All extents are plain images; the volume is a concatenation of
    /// file ranges.
    Fixed,
    /// All extents are sparse ("compressed") images.
    Expanding,
}

/// Parsed and validated contents of a disk descriptor.
#[derive(Debug)]
pub struct DiskDescriptor {
    pub(crate) disk_parameters: DiskParameters,
    pub(crate) disk_type: DiskType,
    pub(crate) extents: Vec<ExtentValues>,
    pub(crate) snapshots: Vec<SnapshotValues>,
}

impl DiskDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = xml::parse(data)?;
        Self::from_root_tag(&root)
    }

    fn from_root_tag(root: &XmlTag) -> Result<Self> {
        if root.name != ROOT_TAG_NAME {
            return Err(PhdError::InvalidFormat(format!("unsupported root tag {:?}", root.name)));
        }
        let parameters_tag =
            root.child("Disk_Parameters").ok_or(PhdError::Missing("Disk_Parameters element"))?;
        let disk_parameters = read_disk_parameters(parameters_tag)?;

        let snapshots = match root.child("Snapshots") {
            Some(tag) => read_snapshots(tag)?,
            None => Vec::new(),
        };

        let storage_data_tag =
            root.child("StorageData").ok_or(PhdError::Missing("StorageData element"))?;
        let (extents, disk_type) = read_storage_data(storage_data_tag, snapshots.len())?;

        debug!(
            "descriptor: {:?} disk, media size {}, {} extent(s), {} snapshot(s)",
            disk_type,
            disk_parameters.media_size,
            extents.len(),
            snapshots.len()
        );
        Ok(DiskDescriptor { disk_parameters, disk_type, extents, snapshots })
    }
}

fn u64_value(tag: &XmlTag) -> Result<u64> {
    tag.value.trim().parse::<u64>().map_err(|_| {
        PhdError::InvalidFormat(format!("invalid {} value: {:?}", tag.name, tag.value))
    })
}

fn read_disk_parameters(parameters_tag: &XmlTag) -> Result<DiskParameters> {
    let mut parameters = DiskParameters::default();

    for element in &parameters_tag.children {
        match element.name.as_str() {
            "Cylinders" => {
                let value = u64_value(element)?;
                parameters.number_of_cylinders = value.try_into().map_err(|_| {
                    PhdError::Unsupported(format!("number of cylinders: {}", value))
                })?;
            }
            "Heads" => {
                let value = u64_value(element)?;
                parameters.number_of_heads = value
                    .try_into()
                    .map_err(|_| PhdError::Unsupported(format!("number of heads: {}", value)))?;
            }
            "Sectors" => {
                parameters.number_of_sectors = u64_value(element)?;
            }
            "Disk_size" => {
                let sectors = u64_value(element)?;
                if sectors > u64::MAX / SECTOR_SIZE {
                    return Err(PhdError::Unsupported(format!("disk size: {} sectors", sectors)));
                }
                parameters.media_size = sectors * SECTOR_SIZE;
            }
            "LogicSectorSize" => {
                let value = u64_value(element)?;
                if value != LOGICAL_SECTOR_SIZE {
                    return Err(PhdError::Unsupported(format!("logical sector size: {}", value)));
                }
            }
            "PhysicalSectorSize" => {
                let value = u64_value(element)?;
                if value != PHYSICAL_SECTOR_SIZE {
                    return Err(PhdError::Unsupported(format!("physical sector size: {}", value)));
                }
            }
            "Padding" => {
                let value = u64_value(element)?;
                if value != 0 {
                    return Err(PhdError::Unsupported(format!("padding: {}", value)));
                }
            }
            "Name" => {
                parameters.name = Some(element.value.clone());
            }
            "UID" => {
                parameters.identifier = Some(Guid::parse(&element.value)?);
            }
            // Encryption and Miscellaneous settings do not affect reads.
            other => debug!("ignoring Disk_Parameters element {:?}", other),
        }
    }
    Ok(parameters)
}

fn read_storage_data(
    storage_data_tag: &XmlTag,
    number_of_snapshots: usize,
) -> Result<(Vec<ExtentValues>, DiskType)> {
    let number_of_storage_elements = storage_data_tag.children.len();
    if number_of_snapshots > 1 && number_of_storage_elements > 1 {
        return Err(PhdError::Unsupported(
            "split storage with snapshots".to_string(),
        ));
    }
    let mut extents = Vec::with_capacity(number_of_storage_elements);
    let mut disk_type: Option<DiskType> = None;

    for storage_tag in &storage_data_tag.children {
        if storage_tag.name != "Storage" {
            return Err(PhdError::Unsupported(format!("storage tag {:?}", storage_tag.name)));
        }
        extents.push(read_storage(storage_tag, &mut disk_type)?);
    }
    if extents.is_empty() {
        return Err(PhdError::Missing("Storage element"));
    }
    // disk_type is seeded by the first image, which every extent has.
    Ok((extents, disk_type.unwrap()))
}

fn read_storage(storage_tag: &XmlTag, disk_type: &mut Option<DiskType>) -> Result<ExtentValues> {
    let mut start_offset: Option<u64> = None;
    let mut end_offset: Option<u64> = None;
    let mut images = Vec::new();

    for element in &storage_tag.children {
        match element.name.as_str() {
            "Start" => {
                let sectors = u64_value(element)?;
                if sectors > i64::MAX as u64 / SECTOR_SIZE {
                    return Err(PhdError::Unsupported(format!("start sector: {}", sectors)));
                }
                start_offset = Some(sectors * SECTOR_SIZE);
            }
            "End" => {
                let sectors = u64_value(element)?;
                if sectors > i64::MAX as u64 / SECTOR_SIZE {
                    return Err(PhdError::Unsupported(format!("end sector: {}", sectors)));
                }
                end_offset = Some(sectors * SECTOR_SIZE);
            }
            "Blocksize" => {
                let value = u64_value(element)?;
                if value != BLOCK_SIZE_IN_SECTORS {
                    return Err(PhdError::Unsupported(format!("block size: {}", value)));
                }
            }
            "Image" => {
                let image = read_image(element)?;
                let image_disk_type = match image.image_type {
                    ImageType::Plain => DiskType::Fixed,
                    ImageType::Compressed => DiskType::Expanding,
                    ImageType::Unknown => {
                        return Err(PhdError::Unsupported("image type".to_string()))
                    }
                };
                match *disk_type {
                    None => *disk_type = Some(image_disk_type),
                    Some(seeded) if seeded != image_disk_type => {
                        return Err(PhdError::Unsupported("mixed image types".to_string()))
                    }
                    Some(_) => {}
                }
                images.push(image);
            }
            other => debug!("ignoring Storage element {:?}", other),
        }
    }
    let start_offset = start_offset.ok_or(PhdError::Missing("Start element"))?;
    let end_offset = end_offset.ok_or(PhdError::Missing("End element"))?;
    if end_offset <= start_offset {
        return Err(PhdError::Unsupported(format!(
            "storage end offset {} not beyond start offset {}",
            end_offset, start_offset
        )));
    }
    let extent_type = match disk_type {
        Some(DiskType::Fixed) => ExtentType::Plain,
        Some(DiskType::Expanding) => ExtentType::Compressed,
        None => return Err(PhdError::Missing("Image element")),
    };
    ExtentValues::new(start_offset as i64, end_offset - start_offset, extent_type, images)
}

fn read_image(image_tag: &XmlTag) -> Result<ImageValues> {
    let identifier_tag = image_tag.child("GUID").ok_or(PhdError::Missing("image GUID element"))?;
    let filename_tag = image_tag.child("File").ok_or(PhdError::Missing("image File element"))?;
    if filename_tag.value.is_empty() {
        return Err(PhdError::Missing("image File value"));
    }
    let image_type = match image_tag.child("Type").map(|tag| tag.value.as_str()) {
        Some("Plain") => ImageType::Plain,
        Some("Compressed") => ImageType::Compressed,
        _ => ImageType::Unknown,
    };
    Ok(ImageValues {
        identifier: Guid::parse(&identifier_tag.value)?,
        filename: filename_tag.value.clone(),
        image_type,
    })
}

fn read_snapshots(snapshots_tag: &XmlTag) -> Result<Vec<SnapshotValues>> {
    let mut snapshots = Vec::new();
    for shot_tag in snapshots_tag.children_named("Shot") {
        let identifier_tag =
            shot_tag.child("GUID").ok_or(PhdError::Missing("snapshot GUID element"))?;
        let parent_identifier = match shot_tag.child("ParentGUID") {
            Some(tag) => Guid::parse(&tag.value)?,
            None => Guid::NIL,
        };
        snapshots.push(SnapshotValues::new(Guid::parse(&identifier_tag.value)?, parent_identifier));
    }
    Ok(snapshots)
}
