// Copyright 2020 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded pool of open extent files.
//!
//! Every extent of a disk owns one pool entry, by convention at the index
//! equal to the extent index. The pool keeps at most
//! `maximum_number_of_open_handles` files open at once; when the bound is
//! hit the least-recently-used path-backed entry is closed and reopened on
//! demand. Reads are positional, so entries carry no file position and can
//! be shared by concurrent readers.

use {
    crate::{
        error::{PhdError, Result},
        readers::read_exact_at,
    },
    log::debug,
    parking_lot::Mutex,
    std::{fs::File, path::PathBuf, sync::Arc},
};

struct PoolEntry {
    /// Path the entry can be reopened from. Entries appended as bare files
    /// have no path and stay open for the pool's lifetime.
    path: Option<PathBuf>,
    file: Option<Arc<File>>,
    size: u64,
    last_use: u64,
}

struct PoolInner {
    entries: Vec<PoolEntry>,
    /// 0 means unlimited.
    maximum_number_of_open_handles: usize,
    use_counter: u64,
}

pub struct FileIoPool {
    inner: Mutex<PoolInner>,
}

impl FileIoPool {
    pub fn new(maximum_number_of_open_handles: usize) -> Self {
        FileIoPool {
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                maximum_number_of_open_handles,
                use_counter: 0,
            }),
        }
    }

    pub fn number_of_entries(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Opens `path` and appends it as the next pool entry, returning the
    /// entry index. The same path cannot be added twice.
    pub fn append_path(&self, path: PathBuf) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|entry| entry.path.as_ref() == Some(&path)) {
            return Err(PhdError::AlreadyOpen);
        }
        let file = File::open(&path).map_err(|error| {
            PhdError::Io(std::io::Error::new(
                error.kind(),
                format!("unable to open {}: {}", path.display(), error),
            ))
        })?;
        let size = file.metadata()?.len();
        let entry_index = inner.entries.len();
        let last_use = inner.next_use();
        inner.entries.push(PoolEntry {
            path: Some(path),
            file: Some(Arc::new(file)),
            size,
            last_use,
        });
        inner.close_least_recently_used_if_full();
        Ok(entry_index)
    }

    /// Appends an already-open file as the next pool entry. Pathless
    /// entries cannot be reopened and are never closed by the LRU bound.
    pub fn append_file(&self, file: File) -> Result<usize> {
        let size = file.metadata()?.len();
        let mut inner = self.inner.lock();
        let entry_index = inner.entries.len();
        let last_use = inner.next_use();
        inner.entries.push(PoolEntry { path: None, file: Some(Arc::new(file)), size, last_use });
        Ok(entry_index)
    }

    pub fn entry_size(&self, entry: usize) -> Result<u64> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(entry)
            .ok_or(PhdError::InvalidArgument("file IO pool entry out of bounds"))?;
        Ok(entry.size)
    }

    /// Fills all of `data` from `offset` in the entry's file.
    pub fn read_at(&self, entry: usize, offset: u64, data: &mut [u8]) -> Result<()> {
        // Take the file out under the lock, read without it: an eviction
        // racing with this read cannot close the file mid-transfer.
        let file = self.file_for_entry(entry)?;
        read_exact_at(&file, offset, data)?;
        Ok(())
    }

    pub fn set_maximum_number_of_open_handles(&self, maximum: usize) {
        let mut inner = self.inner.lock();
        inner.maximum_number_of_open_handles = maximum;
        while inner.over_limit() {
            if !inner.close_least_recently_used() {
                break;
            }
        }
    }

    /// Closes every open file. Entries remain reopenable through their
    /// paths.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            entry.file = None;
        }
    }

    fn file_for_entry(&self, entry_index: usize) -> Result<Arc<File>> {
        let mut inner = self.inner.lock();
        let last_use = inner.next_use();
        let entry = inner
            .entries
            .get_mut(entry_index)
            .ok_or(PhdError::InvalidArgument("file IO pool entry out of bounds"))?;
        entry.last_use = last_use;
        if let Some(file) = &entry.file {
            return Ok(Arc::clone(file));
        }
        let path = entry.path.clone().ok_or_else(|| {
            PhdError::NotFound(format!("closed file IO pool entry: {}", entry_index))
        })?;
        let file = Arc::new(File::open(&path)?);
        inner.entries[entry_index].file = Some(Arc::clone(&file));
        inner.close_least_recently_used_if_full();
        Ok(file)
    }
}

impl PoolInner {
    fn next_use(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    fn open_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.file.is_some()).count()
    }

    fn over_limit(&self) -> bool {
        self.maximum_number_of_open_handles != 0
            && self.open_count() > self.maximum_number_of_open_handles
    }

    fn close_least_recently_used_if_full(&mut self) {
        while self.over_limit() {
            if !self.close_least_recently_used() {
                break;
            }
        }
    }

    /// Closes the least-recently-used reopenable entry. Returns false when
    /// nothing can be closed.
    fn close_least_recently_used(&mut self) -> bool {
        let target = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.file.is_some() && entry.path.is_some())
            .min_by_key(|(_, entry)| entry.last_use)
            .map(|(index, _)| index);
        match target {
            Some(index) => {
                debug!("file IO pool: closing least-recently-used entry {}", index);
                self.entries[index].file = None;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        matches::assert_matches,
        std::{fs, io::Write},
        tempfile::tempdir,
    };

    fn write_file(dir: &std::path::Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(contents).expect("write");
        path
    }

    #[test]
    fn read_at_returns_entry_bytes() {
        let dir = tempdir().expect("tempdir");
        let pool = FileIoPool::new(0);
        let a = pool.append_path(write_file(dir.path(), "a", b"aaaa")).expect("append");
        let b = pool.append_path(write_file(dir.path(), "b", b"0123456789")).expect("append");
        assert_eq!((a, b), (0, 1));
        assert_eq!(pool.number_of_entries(), 2);
        assert_eq!(pool.entry_size(1).unwrap(), 10);

        let mut buf = [0u8; 4];
        pool.read_at(1, 3, &mut buf).expect("read");
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn bound_closes_and_reopens_entries() {
        let dir = tempdir().expect("tempdir");
        let pool = FileIoPool::new(2);
        for i in 0..4 {
            let contents = vec![i as u8; 8];
            pool.append_path(write_file(dir.path(), &format!("f{}", i), &contents))
                .expect("append");
        }
        // All four entries stay readable even though at most two files are
        // open at any point.
        for i in (0..4).rev() {
            let mut buf = [0u8; 8];
            pool.read_at(i, 0, &mut buf).expect("read");
            assert_eq!(buf, [i as u8; 8]);
        }
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = write_file(dir.path(), "a", b"aaaa");
        let pool = FileIoPool::new(0);
        pool.append_path(path.clone()).expect("append");
        assert_matches!(pool.append_path(path), Err(PhdError::AlreadyOpen));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempdir().expect("tempdir");
        let pool = FileIoPool::new(0);
        let error = pool.append_path(dir.path().join("missing.hdd")).unwrap_err();
        assert!(error.to_string().contains("missing.hdd"));
    }

    #[test]
    fn short_read_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let pool = FileIoPool::new(0);
        pool.append_path(write_file(dir.path(), "a", b"abcd")).expect("append");
        let mut buf = [0u8; 8];
        assert_matches!(pool.read_at(0, 2, &mut buf), Err(PhdError::Io(_)));
    }

    #[test]
    fn out_of_bounds_entry_is_invalid() {
        let pool = FileIoPool::new(0);
        let mut buf = [0u8; 1];
        assert_matches!(pool.read_at(0, 0, &mut buf), Err(PhdError::InvalidArgument(_)));
    }
}
