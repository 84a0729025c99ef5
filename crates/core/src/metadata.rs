//! Metadata sideband interface.
//!
//! The engine treats per-vector payloads as an external collaborator behind
//! [`MetadataStore`]: it appends alongside adds, copies payloads into search
//! results on request, and refines the store through the same permutation as
//! the samples. [`MemMetadataStore`] is the bundled in-memory implementation.
//!
//! The streaming form writes two blobs: raw concatenated payloads, and an
//! offset table `(count, count+1 × u64)`.

use std::io::Write;

use crate::error::Result;
use crate::persistence::{write_i32, write_u64};

/// Per-vector byte payloads, indexed by vid.
pub trait MetadataStore: Send + Sync {
    /// Number of records held.
    fn count(&self) -> usize;

    /// Copy of the payload for `vid`; empty when out of range.
    fn get_copy(&self, vid: i32) -> Vec<u8>;

    /// Append one payload.
    fn add(&mut self, payload: Vec<u8>);

    /// Drop records for ids `>= count` after a failed append.
    fn truncate(&mut self, count: usize);

    /// Materialize the refine permutation: new record `j` is old record
    /// `indices[j]`.
    fn refine(&self, indices: &[i32]) -> Box<dyn MetadataStore>;

    /// Stream the refined records as (payload blob, offset blob).
    fn refine_to(
        &self,
        indices: &[i32],
        meta_out: &mut dyn Write,
        offsets_out: &mut dyn Write,
    ) -> Result<()>;
}

/// In-memory metadata store.
#[derive(Debug, Clone, Default)]
pub struct MemMetadataStore {
    records: Vec<Vec<u8>>,
}

impl MemMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Vec<u8>>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }
}

impl MetadataStore for MemMetadataStore {
    fn count(&self) -> usize {
        self.records.len()
    }

    fn get_copy(&self, vid: i32) -> Vec<u8> {
        if vid < 0 {
            return Vec::new();
        }
        self.records.get(vid as usize).cloned().unwrap_or_default()
    }

    fn add(&mut self, payload: Vec<u8>) {
        self.records.push(payload);
    }

    fn truncate(&mut self, count: usize) {
        self.records.truncate(count);
    }

    fn refine(&self, indices: &[i32]) -> Box<dyn MetadataStore> {
        Box::new(Self {
            records: indices
                .iter()
                .map(|&old| self.records[old as usize].clone())
                .collect(),
        })
    }

    fn refine_to(
        &self,
        indices: &[i32],
        meta_out: &mut dyn Write,
        offsets_out: &mut dyn Write,
    ) -> Result<()> {
        write_i32(offsets_out, indices.len() as i32)?;
        let mut offset = 0u64;
        write_u64(offsets_out, 0)?;
        for &old in indices {
            let record = &self.records[old as usize];
            meta_out.write_all(record)?;
            offset += record.len() as u64;
            write_u64(offsets_out, offset)?;
        }
        Ok(())
    }
}
