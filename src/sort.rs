//! External sort for fixed-width record files.
//!
//! A shard is sorted in two phases. First the file is divided into chunks
//! no larger than the working-set budget (rounded down to a multiple of the
//! page size and of the record width) and each chunk is sorted
//! independently, in place through a writable mapping. Then the sorted
//! chunks are k-way merged through a min-heap into a temporary file that
//! atomically replaces the shard. Records compare as raw unsigned bytes
//! over exactly the record width, so the result is ascending by encoded
//! key; byte-identical records may land in either order.

use crate::error::{Result, StoreError};
use memmap2::{Mmap, MmapMut};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

const PAGE_SIZE: usize = 4096;

/// Chunk byte count for a given record width and working-set budget:
/// the budget rounded down to a page- and record-aligned size, but never
/// smaller than one record.
fn chunk_size(width: usize, budget: usize) -> usize {
    let paged = budget / PAGE_SIZE * PAGE_SIZE;
    let aligned = paged / width * width;
    aligned.max(width)
}

fn sort_chunk(chunk: &mut [u8], width: usize) {
    let snapshot = chunk.to_vec();
    let mut records: Vec<&[u8]> = snapshot.chunks_exact(width).collect();
    records.sort_unstable();

    for (dst, src) in chunk.chunks_exact_mut(width).zip(records) {
        dst.copy_from_slice(src);
    }
}

/// Sort the records of `path` ascending by raw byte order.
///
/// The file length must be a multiple of `width`; anything else means a
/// record was torn and the shard is inconsistent. A failure part-way
/// through leaves the file in an unspecified order; the operation is not
/// resumable and must be re-run from the pre-sort shard.
pub fn sort_file(path: &Path, width: usize, budget: usize) -> Result<()> {
    assert!(width > 0, "record width must be positive");

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();

    if len % width as u64 != 0 {
        return Err(StoreError::TruncatedShard {
            path: path.to_path_buf(),
            len,
            width,
        });
    }
    if len <= width as u64 {
        return Ok(());
    }

    let chunk_bytes = chunk_size(width, budget);

    {
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let total = map.len();
        let mut done = 0usize;

        for chunk in map.chunks_mut(chunk_bytes) {
            sort_chunk(chunk, width);
            done += chunk.len();
            log::debug!("{}: chunk sort {}%", path.display(), done * 100 / total);
        }

        map.flush()?;
    }

    if len as usize <= chunk_bytes {
        return Ok(());
    }

    merge_chunks(path, &file, width, chunk_bytes)
}

/// K-way merge of the sorted chunks of `file` into a temporary that
/// replaces `path`.
fn merge_chunks(path: &Path, file: &File, width: usize, chunk_bytes: usize) -> Result<()> {
    let map = unsafe { Mmap::map(file)? };

    let tmp = path.with_extension("sort");
    let mut writer = BufWriter::with_capacity(1 << 20, File::create(&tmp)?);

    // One cursor per chunk, keyed in the heap by its current record.
    let mut heap: BinaryHeap<Reverse<(&[u8], usize)>> = BinaryHeap::new();
    let mut cursors: Vec<(usize, usize)> = Vec::new();

    for (i, start) in (0..map.len()).step_by(chunk_bytes).enumerate() {
        let end = (start + chunk_bytes).min(map.len());
        heap.push(Reverse((&map[start..start + width], i)));
        cursors.push((start + width, end));
    }

    log::info!(
        "{}: merging {} chunks, {} records",
        path.display(),
        cursors.len(),
        map.len() / width
    );

    let total = map.len() / width;
    let step = (total / 10).max(1);
    let mut emitted = 0usize;

    while let Some(Reverse((record, i))) = heap.pop() {
        writer.write_all(record)?;

        emitted += 1;
        if emitted % step == 0 {
            log::debug!("{}: merge {}%", path.display(), emitted * 100 / total);
        }

        let (pos, end) = cursors[i];
        if pos < end {
            heap.push(Reverse((&map[pos..pos + width], i)));
            cursors[i].0 = pos + width;
        }
    }

    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp, path)?;
    Ok(())
}
