// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Location of extent data files on disk.
//!
//! The descriptor names each extent file relative to its own directory.
//! A `<File>` value may carry a path prefix written by another system;
//! only the basename takes part in the join.

use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Character encoding applied when a descriptor filename becomes an OS
/// path. The C ancestry of this format kept a process-wide codepage; here
/// the choice is an explicit value on the handle.
///
/// Descriptor contents are always UTF-8. `Utf8` passes filenames through
/// unchanged, which is also the correct narrow encoding on every modern
/// platform; the OS-specific wide conversion happens inside the standard
/// library at the syscall boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingContext {
    Utf8,
}

impl Default for EncodingContext {
    fn default() -> Self {
        EncodingContext::Utf8
    }
}

/// Strips any path prefix up to the last platform-native separator.
fn extent_data_filename(filename: &str) -> &str {
    match filename.rfind(MAIN_SEPARATOR) {
        Some(index) => &filename[index + MAIN_SEPARATOR.len_utf8()..],
        None => filename,
    }
}

/// Joins the data-files directory with the basename of a descriptor
/// filename. Without a directory the basename stands alone.
pub fn extent_data_file_path(
    data_files_path: Option<&Path>,
    filename: &str,
    _encoding: EncodingContext,
) -> PathBuf {
    let basename = extent_data_filename(filename);
    match data_files_path {
        Some(directory) => directory.join(basename),
        None => PathBuf::from(basename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_filename_without_directory() {
        let path = extent_data_file_path(None, "disk.hdd", EncodingContext::Utf8);
        assert_eq!(path, PathBuf::from("disk.hdd"));
    }

    #[test]
    fn joins_directory_and_filename() {
        let path =
            extent_data_file_path(Some(Path::new("/tmp/images")), "disk.hdd", EncodingContext::Utf8);
        assert_eq!(path, PathBuf::from("/tmp/images").join("disk.hdd"));
    }

    #[cfg(unix)]
    #[test]
    fn path_prefix_in_filename_is_stripped() {
        let path = extent_data_file_path(
            Some(Path::new("/tmp/images")),
            "old/location/disk.hdd",
            EncodingContext::Utf8,
        );
        assert_eq!(path, PathBuf::from("/tmp/images/disk.hdd"));
    }

    #[test]
    fn non_ascii_directory_is_preserved() {
        let path = extent_data_file_path(
            Some(Path::new("/tmp/pärallels")),
            "disk.hdd",
            EncodingContext::Utf8,
        );
        assert_eq!(path, PathBuf::from("/tmp/pärallels").join("disk.hdd"));
    }
}
