use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::checksum::Strong;
use crate::error::{Result, SyncError};
use crate::index::BlockIndex;
use crate::matcher::block_len;
use crate::tree::Tree;
use crate::BLOCK_SIZE;

/// Materializes source bytes for a strong checksum.
///
/// `read_into` addresses a whole file by its content strong; `read_block`
/// addresses a single block by the block's own strong. Both propagate
/// failures and return bytes only on success.
pub trait SourceBlockStore {
    /// Range-read from the file with the given content strong, streaming
    /// into `out`. Returns the number of bytes written.
    fn read_into(
        &self,
        strong: &Strong,
        offset: u64,
        length: u64,
        out: &mut dyn Write,
    ) -> Result<u64>;

    /// Read one full block by its strong checksum.
    fn read_block(&self, strong: &Strong) -> Result<Vec<u8>>;
}

/// A [`SourceBlockStore`] backed by an indexed local tree.
pub struct TreeBlockStore<'a> {
    root: PathBuf,
    tree: &'a Tree,
    index: &'a BlockIndex,
}

impl<'a> TreeBlockStore<'a> {
    pub fn new(root: impl Into<PathBuf>, tree: &'a Tree, index: &'a BlockIndex) -> Self {
        Self {
            root: root.into(),
            tree,
            index,
        }
    }

    fn file_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

impl SourceBlockStore for TreeBlockStore<'_> {
    fn read_into(
        &self,
        strong: &Strong,
        offset: u64,
        length: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let id = self
            .index
            .file_with_strong(strong)
            .ok_or_else(|| SyncError::not_found(format!("source file {strong}")))?;
        let path = self.file_path(&self.tree.rel_path(id));
        let mut file = fs::File::open(&path).map_err(|e| SyncError::io("open", &path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SyncError::io("seek", &path, e))?;
        let written = io::copy(&mut file.take(length), out)
            .map_err(|e| SyncError::io("read", &path, e))?;
        Ok(written)
    }

    fn read_block(&self, strong: &Strong) -> Result<Vec<u8>> {
        let bref = self
            .index
            .block_with_strong(strong)
            .ok_or_else(|| SyncError::not_found(format!("source block {strong}")))?;
        let node = self.tree.node(bref.file);
        let file = node
            .as_file()
            .ok_or_else(|| SyncError::not_found(format!("file owning block {strong}")))?;
        let path = self.file_path(&self.tree.rel_path(bref.file));
        let len = block_len(file.size, bref.position);

        let mut fh = fs::File::open(&path).map_err(|e| SyncError::io("open", &path, e))?;
        fh.seek(SeekFrom::Start(bref.position as u64 * BLOCK_SIZE as u64))
            .map_err(|e| SyncError::io("seek", &path, e))?;
        let mut buf = vec![0u8; len as usize];
        fh.read_exact(&mut buf)
            .map_err(|e| SyncError::io("read", &path, e))?;
        Ok(buf)
    }
}

#[derive(Debug)]
struct Reloc {
    to_rel: String,
    is_dir: bool,
}

/// The destination side of a patch: root path, indexed tree, and the
/// relocation shadow map.
///
/// A relocation entry shadows lookups of the original relpath until it is
/// cleaned; for a relocated directory the shadow also covers the paths that
/// used to live beneath it.
pub struct LocalStore {
    root: PathBuf,
    tree: Tree,
    index: BlockIndex,
    relocs: HashMap<String, Reloc>,
    reloc_seq: usize,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, tree: Tree, index: BlockIndex) -> Self {
        Self {
            root: root.into(),
            tree,
            index,
            relocs: HashMap::new(),
            reloc_seq: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn rel_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        rel.to_str().map(str::to_owned)
    }

    /// Absolute path where new content for `rel` is written. Never consults
    /// the shadow map: relocations redirect reads of displaced content, not
    /// writes of replacement content.
    pub fn dest_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Resolve a relative path to its current on-disk location, following
    /// the relocation shadow map.
    pub fn resolve(&self, rel: &str) -> PathBuf {
        if let Some(reloc) = self.relocs.get(rel) {
            return self.dest_path(&reloc.to_rel);
        }
        // A path under a relocated directory resolves into the relocation.
        for (orig, reloc) in &self.relocs {
            if reloc.is_dir
                && !orig.is_empty()
                && rel.len() > orig.len()
                && rel.starts_with(orig.as_str())
                && rel.as_bytes()[orig.len()] == b'/'
            {
                return self.dest_path(&reloc.to_rel).join(&rel[orig.len() + 1..]);
            }
        }
        self.dest_path(rel)
    }

    pub fn is_shadowed(&self, rel: &str) -> bool {
        self.relocs.contains_key(rel)
    }

    fn alloc_reloc_rel(&mut self) -> String {
        loop {
            self.reloc_seq += 1;
            let rel = format!("_reloc{}", self.reloc_seq);
            if !self.dest_path(&rel).exists() {
                return rel;
            }
        }
    }

    /// Move the entry at `rel` out of the way to a freshly allocated
    /// root-level `_reloc<N>` name and record the shadow entry.
    pub fn relocate(&mut self, rel: &str) -> Result<String> {
        let abs = self.resolve(rel);
        let meta =
            fs::symlink_metadata(&abs).map_err(|e| SyncError::io("stat", &abs, e))?;
        let reloc_rel = self.alloc_reloc_rel();
        let reloc_abs = self.dest_path(&reloc_rel);
        fs::rename(&abs, &reloc_abs).map_err(|e| SyncError::io("rename", &abs, e))?;
        debug!(from = rel, to = %reloc_rel, "relocated conflicting entry");
        self.relocs.insert(
            rel.to_owned(),
            Reloc {
                to_rel: reloc_rel.clone(),
                is_dir: meta.is_dir(),
            },
        );
        Ok(reloc_rel)
    }

    /// Copy the file at `rel` to a `_reloc<N>` name and shadow the original.
    /// Used to preserve content that later commands still read while the
    /// real path is about to be overwritten.
    pub fn relocate_copy(&mut self, rel: &str) -> Result<String> {
        let abs = self.resolve(rel);
        let reloc_rel = self.alloc_reloc_rel();
        let reloc_abs = self.dest_path(&reloc_rel);
        fs::copy(&abs, &reloc_abs).map_err(|e| SyncError::io("copy", &abs, e))?;
        debug!(from = rel, to = %reloc_rel, "preserved referenced content");
        self.relocs.insert(
            rel.to_owned(),
            Reloc {
                to_rel: reloc_rel.clone(),
                is_dir: false,
            },
        );
        Ok(reloc_rel)
    }

    /// Delete the relocated entry for `rel` and clear its shadow entry.
    /// A relocation that was already consumed (moved into place) is fine.
    pub fn cleanup_reloc(&mut self, rel: &str) -> Result<()> {
        let Some(reloc) = self.relocs.remove(rel) else {
            return Ok(());
        };
        let abs = self.dest_path(&reloc.to_rel);
        let result = if reloc.is_dir {
            fs::remove_dir_all(&abs)
        } else {
            fs::remove_file(&abs)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io("remove", &abs, e)),
        }
    }

    /// Relpaths with live shadow entries, for post-success cleanup.
    pub fn shadowed_paths(&self) -> Vec<String> {
        self.relocs.keys().cloned().collect()
    }
}
