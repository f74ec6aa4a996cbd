// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        error::{PhdError, Result},
        guid::Guid,
    },
    std::fmt,
};

/// Image type declared by an `<Image>` element's `<Type>` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageType {
    Plain,
    Compressed,
    Unknown,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::Plain => write!(f, "Plain"),
            ImageType::Compressed => write!(f, "Compressed"),
            ImageType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Extent type, derived from the type of the extent's images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentType {
    Plain,
    Compressed,
}

/// One backing file listed inside a `<Storage>` element.
#[derive(Clone, Debug)]
pub struct ImageValues {
    pub(crate) identifier: Guid,
    pub(crate) filename: String,
    pub(crate) image_type: ImageType,
}

impl ImageValues {
    pub fn identifier(&self) -> &Guid {
        &self.identifier
    }

    /// Filename relative to the descriptor directory, as written in the
    /// descriptor. May contain path separators; only the basename is used
    /// when locating the file.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }
}

/// Immutable metadata for one descriptor-declared extent.
///
/// `offset` and `size` are byte values: the descriptor's `<Start>` and
/// `<End>` sector counts multiplied by 512.
#[derive(Clone, Debug)]
pub struct ExtentValues {
    pub(crate) offset: i64,
    pub(crate) size: u64,
    pub(crate) extent_type: ExtentType,
    pub(crate) images: Vec<ImageValues>,
}

impl ExtentValues {
    pub(crate) fn new(
        offset: i64,
        size: u64,
        extent_type: ExtentType,
        images: Vec<ImageValues>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(PhdError::InvalidArgument("extent size is zero"));
        }
        if images.is_empty() {
            return Err(PhdError::Missing("extent image"));
        }
        Ok(ExtentValues { offset, size, extent_type, images })
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extent_type(&self) -> ExtentType {
        self.extent_type
    }

    pub fn images(&self) -> &[ImageValues] {
        &self.images
    }

    /// The image the reader resolves data through.
    pub fn first_image(&self) -> &ImageValues {
        &self.images[0]
    }
}
