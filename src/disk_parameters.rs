// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::guid::Guid;

/// Disk-wide values projected from the descriptor's `Disk_Parameters`
/// element. The descriptor stores `Disk_size` in 512-byte sectors;
/// `media_size` is the byte value.
#[derive(Debug, Default, Clone)]
pub struct DiskParameters {
    pub(crate) media_size: u64,
    pub(crate) number_of_cylinders: u32,
    pub(crate) number_of_heads: u32,
    pub(crate) number_of_sectors: u64,
    pub(crate) name: Option<String>,
    pub(crate) identifier: Option<Guid>,
}

impl DiskParameters {
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub fn number_of_cylinders(&self) -> u32 {
        self.number_of_cylinders
    }

    pub fn number_of_heads(&self) -> u32 {
        self.number_of_heads
    }

    pub fn number_of_sectors(&self) -> u64 {
        self.number_of_sectors
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn identifier(&self) -> Option<&Guid> {
        self.identifier.as_ref()
    }
}
