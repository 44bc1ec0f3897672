use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;

use crate::checksum::{RollingSum, Strong};
use crate::error::{Result, SyncError};
use crate::tree::File;
use crate::BLOCK_SIZE;

/// A source block found in the destination, possibly at a shifted offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMatch {
    pub src_position: usize,
    pub dst_offset: u64,
}

/// Which byte ranges of an indexed source file are already present in a
/// destination file on disk.
#[derive(Debug)]
pub struct FileMatch {
    pub src_size: u64,
    pub matches: Vec<BlockMatch>,
}

impl FileMatch {
    /// The complement of the matched source ranges within `[0, src_size)`:
    /// ordered, pairwise-disjoint half-open ranges that must be fetched from
    /// the source store. An empty source yields the degenerate `[0, 0)`.
    pub fn not_matched(&self) -> Vec<Range<u64>> {
        if self.src_size == 0 {
            return vec![0..0];
        }
        let block = BLOCK_SIZE as u64;
        let mut positions: Vec<u64> = self
            .matches
            .iter()
            .map(|m| m.src_position as u64)
            .collect();
        positions.sort_unstable();

        let mut ranges = Vec::new();
        let mut cursor = 0u64;
        for pos in positions {
            let start = pos * block;
            let end = (start + block).min(self.src_size);
            if start > cursor {
                ranges.push(cursor..start);
            }
            cursor = end;
        }
        if cursor < self.src_size {
            ranges.push(cursor..self.src_size);
        }
        ranges
    }
}

/// Byte length of the source block at `position` within a file of `size`.
pub fn block_len(size: u64, position: usize) -> u64 {
    let block = BLOCK_SIZE as u64;
    let start = position as u64 * block;
    block.min(size - start)
}

/// Scan the destination file at `dst_path` for blocks of the indexed source
/// file `src`, rsync-style.
///
/// The window slides one byte at a time over the memory-mapped destination;
/// a weak-table hit is confirmed by a strong comparison before a match is
/// emitted, so weak collisions never produce a false match. A matched
/// destination region is consumed whole (non-overlapping reuse) and the
/// weak sum is re-seeded behind it. Once the window tail reaches end of
/// file the window shrinks from the front, which lets a short trailing
/// source block match at the destination tail. The first candidate in
/// iteration order wins; a source position already claimed is never
/// emitted a second time.
pub fn match_file(src: &File, dst_path: &Path) -> Result<FileMatch> {
    let mut matches = Vec::new();
    let meta =
        fs::metadata(dst_path).map_err(|e| SyncError::io("stat", dst_path, e))?;
    if meta.len() == 0 || src.blocks.is_empty() {
        return Ok(FileMatch {
            src_size: src.size,
            matches,
        });
    }

    let file = fs::File::open(dst_path).map_err(|e| SyncError::io("open", dst_path, e))?;
    // SAFETY: read-only mapping; the destination tree is not mutated while
    // a plan is being built.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| SyncError::io("mmap", dst_path, e))?;
    let data: &[u8] = &map;

    let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::with_capacity(src.blocks.len());
    for (i, block) in src.blocks.iter().enumerate() {
        by_weak.entry(block.weak).or_default().push(i);
    }
    let mut claimed = vec![false; src.blocks.len()];

    let mut pos: usize = 0;
    let mut window = BLOCK_SIZE.min(data.len());
    let mut sum = RollingSum::new();
    sum.seed(&data[..window]);

    loop {
        let mut hit = false;
        if let Some(candidates) = by_weak.get(&sum.digest()) {
            let strong = Strong::of(&data[pos..pos + window]);
            for &i in candidates {
                if claimed[i] || src.blocks[i].strong != strong {
                    continue;
                }
                claimed[i] = true;
                matches.push(BlockMatch {
                    src_position: src.blocks[i].position,
                    dst_offset: pos as u64,
                });
                hit = true;
                break;
            }
        }

        if hit {
            // Consume the matched region and re-seed behind it.
            pos += window;
            if pos >= data.len() {
                break;
            }
            window = BLOCK_SIZE.min(data.len() - pos);
            sum.seed(&data[pos..pos + window]);
        } else if pos + window < data.len() {
            sum.roll(data[pos], data[pos + window]);
            pos += 1;
        } else {
            // Window tail is at end of file: shrink from the front.
            sum.roll_out(data[pos]);
            pos += 1;
            window -= 1;
            if window == 0 {
                break;
            }
        }
    }

    Ok(FileMatch {
        src_size: src.size,
        matches,
    })
}
