// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::guid::Guid;

/// Metadata for one `<Shot>` element. Snapshots are not consulted when
/// resolving read data; they are exposed for inspection only.
#[derive(Clone, Debug)]
pub struct SnapshotValues {
    pub(crate) identifier: Guid,
    pub(crate) parent_identifier: Option<Guid>,
}

impl SnapshotValues {
    pub(crate) fn new(identifier: Guid, parent_identifier: Guid) -> Self {
        // A nil ParentGUID marks a root snapshot.
        let parent_identifier =
            if parent_identifier.is_nil() { None } else { Some(parent_identifier) };
        SnapshotValues { identifier, parent_identifier }
    }

    pub fn identifier(&self) -> &Guid {
        &self.identifier
    }

    pub fn parent_identifier(&self) -> Option<&Guid> {
        self.parent_identifier.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_parent_is_none() {
        let snapshot =
            SnapshotValues::new(Guid::from_bytes([1u8; 16]), Guid::NIL);
        assert!(snapshot.parent_identifier().is_none());
    }

    #[test]
    fn non_nil_parent_is_kept() {
        let parent = Guid::from_bytes([2u8; 16]);
        let snapshot = SnapshotValues::new(Guid::from_bytes([1u8; 16]), parent);
        assert_eq!(snapshot.parent_identifier(), Some(&parent));
    }
}
