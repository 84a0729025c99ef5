//! Block-partitioned sample store.
//!
//! [`BlockStore`] holds the (R, D) sample matrix as a sequence of fixed-size
//! row blocks. Row `i` always lives at block `i / block_size`, offset
//! `i % block_size`; appends allocate new blocks and never relocate existing
//! rows, so a row slice handed out under a read lock stays valid for the
//! guard's lifetime. Compaction materializes a permutation into a fresh store.

use std::io::{Read, Write};

use crate::element::{ElementType, VectorValue};
use crate::error::{EngineError, Result};
use crate::persistence::{read_exact_buf, read_i32, read_u8, write_i32, write_u8};
use crate::prefetch::fetch_ahead;

/// Append-only block-partitioned matrix of D-dimensional vectors.
#[derive(Debug, Clone)]
pub struct BlockStore<T> {
    blocks: Vec<Box<[T]>>,
    rows: usize,
    dim: usize,
    block_size: usize,
    capacity: usize,
}

impl<T: VectorValue> BlockStore<T> {
    /// Create an empty store.
    pub fn new(dim: usize, block_size: usize, capacity: usize) -> Self {
        Self {
            blocks: Vec::new(),
            rows: 0,
            dim,
            block_size: block_size.max(1),
            capacity,
        }
    }

    /// Create a store holding a copy of `rows` packed row-major vectors.
    pub fn with_data(
        data: &[T],
        rows: usize,
        dim: usize,
        block_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        if data.len() != rows * dim {
            return Err(EngineError::DimensionMismatch {
                expected: rows * dim,
                got: data.len(),
            });
        }
        let mut store = Self::new(dim, block_size, capacity);
        store.add_batch(data, rows)?;
        Ok(store)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contiguous D-element slice for row `i`.
    #[inline]
    pub fn row(&self, i: i32) -> &[T] {
        let i = i as usize;
        debug_assert!(i < self.rows);
        let start = (i % self.block_size) * self.dim;
        &self.blocks[i / self.block_size][start..start + self.dim]
    }

    /// Mutable slice for row `i` (normalization only).
    #[inline]
    pub fn row_mut(&mut self, i: i32) -> &mut [T] {
        let i = i as usize;
        debug_assert!(i < self.rows);
        let start = (i % self.block_size) * self.dim;
        &mut self.blocks[i / self.block_size][start..start + self.dim]
    }

    /// Hint that row `i` will be read shortly. Best-effort.
    #[inline(always)]
    pub fn prefetch_row(&self, i: i32) {
        let i = i as usize;
        if i < self.rows {
            let start = (i % self.block_size) * self.dim;
            let row = &self.blocks[i / self.block_size][start..start + self.dim];
            fetch_ahead(row.as_ptr().cast(), self.dim * T::WIDTH);
        }
    }

    /// Append `n` packed row-major vectors. Existing rows never move.
    /// Fails with `MemoryOverflow` when the capacity would be exceeded,
    /// leaving the store unchanged.
    pub fn add_batch(&mut self, data: &[T], n: usize) -> Result<()> {
        if data.len() != n * self.dim {
            return Err(EngineError::DimensionMismatch {
                expected: n * self.dim,
                got: data.len(),
            });
        }
        if self.rows + n > self.capacity {
            return Err(EngineError::MemoryOverflow);
        }
        let mut src = 0usize;
        let mut row = self.rows;
        while src < n {
            let block = row / self.block_size;
            let offset = row % self.block_size;
            if block == self.blocks.len() {
                self.blocks
                    .push(vec![T::default(); self.block_size * self.dim].into_boxed_slice());
            }
            let take = (self.block_size - offset).min(n - src);
            let dst = &mut self.blocks[block][offset * self.dim..(offset + take) * self.dim];
            dst.copy_from_slice(&data[src * self.dim..(src + take) * self.dim]);
            src += take;
            row += take;
        }
        self.rows = row;
        Ok(())
    }

    /// Truncate the logical row count. Used to restore invariants after a
    /// partial append failure; allocated blocks are kept.
    pub fn set_rows(&mut self, rows: usize) {
        debug_assert!(rows <= self.rows);
        self.rows = rows;
    }

    /// Materialize a permutation: new row `j` is a copy of old row
    /// `indices[j]`.
    pub fn refine(&self, indices: &[i32]) -> Result<Self> {
        let mut out = Self::new(self.dim, self.block_size, self.capacity);
        for &old in indices {
            out.add_batch(self.row(old), 1)?;
        }
        Ok(out)
    }

    /// Stream the refined store as a samples blob without materializing it.
    pub fn refine_to<W: Write + ?Sized>(&self, indices: &[i32], w: &mut W) -> Result<()> {
        self.write_header(indices.len(), w)?;
        let mut buf = vec![0u8; self.dim * T::WIDTH];
        for &old in indices {
            encode_row(self.row(old), &mut buf);
            w.write_all(&buf)?;
        }
        Ok(())
    }

    /// Apply `f` to every row, spread over the given thread pool.
    pub fn for_each_row_mut_parallel<F>(&mut self, pool: &rayon::ThreadPool, f: F)
    where
        F: Fn(&mut [T]) + Send + Sync,
    {
        use rayon::prelude::*;
        let dim = self.dim;
        let block_size = self.block_size;
        let rows = self.rows;
        pool.install(|| {
            for (b, block) in self.blocks.iter_mut().enumerate() {
                let valid = rows.saturating_sub(b * block_size).min(block_size);
                block[..valid * dim]
                    .par_chunks_mut(dim)
                    .for_each(|row| f(row));
            }
        });
    }

    fn write_header<W: Write + ?Sized>(&self, rows: usize, w: &mut W) -> Result<()> {
        write_i32(w, rows as i32)?;
        write_i32(w, self.dim as i32)?;
        write_i32(w, self.block_size as i32)?;
        write_i32(w, self.capacity.min(i32::MAX as usize) as i32)?;
        write_u8(w, T::ELEMENT_TYPE as u8)?;
        Ok(())
    }

    /// Write the samples blob: header `(R, D, blockSize, capacity,
    /// elementType)` followed by R·D little-endian values in row-major order.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        self.write_header(self.rows, w)?;
        let mut buf = vec![0u8; self.dim * T::WIDTH];
        for i in 0..self.rows {
            encode_row(self.row(i as i32), &mut buf);
            w.write_all(&buf)?;
        }
        Ok(())
    }

    /// Read a samples blob, rejecting element-type mismatches.
    pub fn load<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let rows = read_i32(r)? as usize;
        let dim = read_i32(r)? as usize;
        let block_size = read_i32(r)? as usize;
        let capacity = read_i32(r)? as usize;
        let ty = read_u8(r)?;
        if ty != T::ELEMENT_TYPE as u8 {
            return Err(EngineError::FailedParseValue(format!(
                "samples blob element type {:?} does not match index element type {:?}",
                ElementType::from_code(ty)?,
                T::ELEMENT_TYPE
            )));
        }
        if dim == 0 || block_size == 0 || rows > capacity {
            return Err(EngineError::FailedParseValue(
                "samples blob header is inconsistent".into(),
            ));
        }
        let mut store = Self::new(dim, block_size, capacity);
        let mut buf = vec![0u8; dim * T::WIDTH];
        let mut row = vec![T::default(); dim];
        for _ in 0..rows {
            read_exact_buf(r, &mut buf)?;
            for (j, v) in row.iter_mut().enumerate() {
                *v = T::get_le(&buf[j * T::WIDTH..]);
            }
            store.add_batch(&row, 1)?;
        }
        Ok(store)
    }
}

fn encode_row<T: VectorValue>(row: &[T], buf: &mut [u8]) {
    for (j, v) in row.iter().enumerate() {
        v.put_le(&mut buf[j * T::WIDTH..]);
    }
}
