// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {std::io, thiserror::Error};

/// Errors surfaced by the public API.
///
/// A partial read is not an error: `read_buffer` reports the byte count it
/// collected, which may be short when the volume ends or the read is aborted.
#[derive(Debug, Error)]
pub enum PhdError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("{0} is already set")]
    AlreadySet(&'static str),

    #[error("handle is already open")]
    AlreadyOpen,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("allocation too large: {0}")]
    OutOfMemory(&'static str),
}

pub type Result<T> = std::result::Result<T, PhdError>;
