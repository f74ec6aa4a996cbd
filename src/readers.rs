// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::error::PhdError,
    std::{fs::File, io},
    thiserror::Error,
};

#[derive(Debug, Error, PartialEq)]
pub enum ReaderError {
    #[error("read exceeds source bounds at offset 0x{0:X}")]
    OutOfBounds(u64),
    #[error("unable to read from source at offset 0x{0:X}")]
    Read(u64),
}

impl From<ReaderError> for PhdError {
    fn from(err: ReaderError) -> PhdError {
        PhdError::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

/// Byte source for a disk descriptor, for callers that do not keep the
/// descriptor in a file; `Handle::open_reader` accepts any
/// implementation. `FileReader` and `VecReader` cover the common cases.
pub trait Reader: Send + Sync {
    /// Fills all of `data` from `offset`.
    fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), ReaderError>;

    /// Total size of the source in bytes.
    fn size(&self) -> Result<u64, ReaderError>;
}

pub struct VecReader {
    data: Vec<u8>,
}

impl VecReader {
    pub fn new(data: Vec<u8>) -> Self {
        VecReader { data }
    }
}

impl Reader for VecReader {
    fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), ReaderError> {
        let offset = offset as usize;
        let end = offset.checked_add(data.len()).ok_or(ReaderError::OutOfBounds(offset as u64))?;
        match self.data.get(offset..end) {
            Some(source) => {
                data.copy_from_slice(source);
                Ok(())
            }
            None => Err(ReaderError::OutOfBounds(offset as u64)),
        }
    }

    fn size(&self) -> Result<u64, ReaderError> {
        Ok(self.data.len() as u64)
    }
}

pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn new(file: File) -> Self {
        FileReader { file }
    }
}

impl Reader for FileReader {
    fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), ReaderError> {
        read_exact_at(&self.file, offset, data).map_err(|_| ReaderError::Read(offset))
    }

    fn size(&self) -> Result<u64, ReaderError> {
        self.file.metadata().map(|m| m.len()).map_err(|_| ReaderError::Read(0))
    }
}

/// Positional exact read that leaves no shared file position behind.
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut position = offset;
    let mut remaining = buf;
    while !remaining.is_empty() {
        let count = file.seek_read(remaining, position)?;
        if count == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "failed to fill buffer"));
        }
        position += count as u64;
        remaining = &mut remaining[count..];
    }
    Ok(())
}
