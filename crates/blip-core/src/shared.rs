use std::{ops::Deref, sync::Arc};

/// SharedBytes is a reference-counted, sliceable byte buffer.
///
/// Message payloads cross actor boundaries (application, engine, transport)
/// without copying: the buffer is an `Arc<[u8]>` plus a (start, len) view,
/// so sub-slices are cheap and still dereference to `&[u8]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedBytes {
    data: Arc<[u8]>,
    start: usize,
    len: usize,
}

impl SharedBytes {
    /// Creates an empty buffer.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Creates a new SharedBytes from a Vec by taking ownership.
    pub fn from_vec(vec: Vec<u8>) -> Self {
        let arc: Arc<[u8]> = Arc::from(vec.into_boxed_slice());
        let len = arc.len();
        Self { data: arc, start: 0, len }
    }

    /// Creates a sub-slice view into the current buffer without copying.
    /// Panics if the requested range is out of bounds.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        assert!(start <= self.len, "slice start out of bounds");
        assert!(start + len <= self.len, "slice end out of bounds");
        Self { data: self.data.clone(), start: self.start + start, len }
    }

    /// Returns the view starting at `start` and running to the end.
    pub fn slice_from(&self, start: usize) -> Self {
        self.slice(start, self.len - start)
    }

    /// Returns the current view as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    /// Returns the length of the current view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for SharedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl From<&[u8]> for SharedBytes {
    fn from(s: &[u8]) -> Self {
        Self::from_vec(s.to_vec())
    }
}

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
