use std::collections::HashMap;
use std::fs;
use std::io::{self, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::info;
use walkdir::WalkDir;

use crate::checksum::{weak_sum, Strong};
use crate::error::{Result, SyncError};
use crate::tree::{Block, Dir, EntryKind, File, FsNode, NodeId, Tree};
use crate::BLOCK_SIZE;

/// Accepts or rejects entries during an index walk. Rejecting a directory
/// prunes its entire subtree.
pub trait IndexFilter: Sync {
    fn accept(&self, entry: &walkdir::DirEntry) -> bool;
}

/// The default filter: index everything.
pub struct AcceptAll;

impl IndexFilter for AcceptAll {
    fn accept(&self, _entry: &walkdir::DirEntry) -> bool {
        true
    }
}

impl<F> IndexFilter for F
where
    F: Fn(&walkdir::DirEntry) -> bool + Sync,
{
    fn accept(&self, entry: &walkdir::DirEntry) -> bool {
        self(entry)
    }
}

/// Index a tree rooted at `root`.
///
/// A directory root produces a full tree, a regular-file root a single-file
/// index. Unreadable entries are reported through `errs` and skipped; an
/// unreadable root is fatal.
pub fn index_tree(
    root: &Path,
    filter: &dyn IndexFilter,
    errs: &mut Vec<SyncError>,
) -> Result<Tree> {
    let meta = fs::metadata(root).map_err(|e| SyncError::IndexUnreadable {
        path: root.to_path_buf(),
        source: e,
    })?;
    let mode = meta.permissions().mode();
    if meta.is_dir() {
        index_dir_root(root, mode, filter, errs)
    } else {
        index_file_root(root, mode)
    }
}

fn root_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned())
}

fn index_file_root(root: &Path, mode: u32) -> Result<Tree> {
    let (size, strong, blocks) = index_file_blocks(root)?;
    Ok(Tree::with_root(FsNode::File(File {
        name: root_name(root),
        size,
        mode,
        strong,
        parent: None,
        blocks,
    })))
}

struct RawEntry {
    rel: String,
    kind: EntryKind,
    mode: u32,
    abs: PathBuf,
}

fn index_dir_root(
    root: &Path,
    root_mode: u32,
    filter: &dyn IndexFilter,
    errs: &mut Vec<SyncError>,
) -> Result<Tree> {
    // Stage 1: name-sorted walk. Sorting fixes the iteration order, which
    // both the directory strongs and the block index rely on.
    let mut entries: Vec<RawEntry> = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).sort_by_file_name();
    for item in walker.into_iter().filter_entry(|e| filter.accept(e)) {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                errs.push(walk_error(root, err));
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            errs.push(SyncError::NonUtf8Path {
                path: entry.path().to_path_buf(),
            });
            continue;
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                errs.push(walk_error(root, err));
                continue;
            }
        };
        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(RawEntry {
            rel: rel.to_owned(),
            kind,
            mode: meta.permissions().mode(),
            abs: entry.into_path(),
        });
    }

    // Stage 2: hash file blocks in parallel.
    let file_indices: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind == EntryKind::File)
        .map(|(i, _)| i)
        .collect();
    let mut hashed: HashMap<usize, Result<(u64, Strong, Vec<Block>)>> = file_indices
        .par_iter()
        .map(|&i| (i, index_file_blocks(&entries[i].abs)))
        .collect();

    // Stage 3: assemble the tree, then fill directory strongs bottom-up.
    let mut tree = Tree::with_root(FsNode::Dir(Dir {
        name: root_name(root),
        mode: root_mode,
        strong: Strong::of(&[]),
        parent: None,
        subdirs: Vec::new(),
        files: Vec::new(),
    }));
    let mut dir_ids: HashMap<String, NodeId> = HashMap::new();
    dir_ids.insert(String::new(), tree.root());

    for (i, entry) in entries.iter().enumerate() {
        let (parent_rel, name) = match entry.rel.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", entry.rel.as_str()),
        };
        // A missing parent means the parent entry itself was skipped.
        let Some(&parent) = dir_ids.get(parent_rel) else {
            continue;
        };
        match entry.kind {
            EntryKind::Dir => {
                let id = tree.push(FsNode::Dir(Dir {
                    name: name.to_owned(),
                    mode: entry.mode,
                    strong: Strong::of(&[]),
                    parent: Some(parent),
                    subdirs: Vec::new(),
                    files: Vec::new(),
                }));
                dir_ids.insert(entry.rel.clone(), id);
            }
            EntryKind::File => match hashed.remove(&i) {
                Some(Ok((size, strong, blocks))) => {
                    tree.push(FsNode::File(File {
                        name: name.to_owned(),
                        size,
                        mode: entry.mode,
                        strong,
                        parent: Some(parent),
                        blocks,
                    }));
                }
                Some(Err(err)) => errs.push(err),
                None => {}
            },
        }
    }

    tree.finalize_dir_strongs();
    info!(entries = tree.len() - 1, root = %root.display(), "indexed tree");
    Ok(tree)
}

fn walk_error(root: &Path, err: walkdir::Error) -> SyncError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("filesystem loop"));
    SyncError::io("walk", path, source)
}

/// Stream a file in `BLOCK_SIZE` chunks: one [`Block`] per non-empty chunk
/// plus a single running digest over the whole content.
pub(crate) fn index_file_blocks(path: &Path) -> Result<(u64, Strong, Vec<Block>)> {
    let file = fs::File::open(path).map_err(|e| SyncError::io("open", path, e))?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut size = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf).map_err(|e| SyncError::io("read", path, e))?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        hasher.update(chunk);
        blocks.push(Block {
            position: blocks.len(),
            weak: weak_sum(chunk),
            strong: Strong::of(chunk),
        });
        size += n as u64;
        if n < BLOCK_SIZE {
            break;
        }
    }
    Ok((size, hasher.finalize().into(), blocks))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A block's parent linkage: the file node it belongs to and its position.
#[derive(Debug, Clone, Copy)]
pub struct BlockRef {
    pub file: NodeId,
    pub position: usize,
}

/// Flat lookup structures derived from a finalized [`Tree`] in one pass.
///
/// The weak map is many-to-many (weak collisions are expected); the strong
/// maps are one-to-one under the digest's collision resistance, with the
/// first-indexed node winning on duplicate content.
#[derive(Debug, Default)]
pub struct BlockIndex {
    weak: HashMap<u32, Vec<BlockRef>>,
    files: HashMap<Strong, NodeId>,
    dirs: HashMap<Strong, NodeId>,
    blocks: HashMap<Strong, BlockRef>,
}

impl BlockIndex {
    pub fn build(tree: &Tree) -> Self {
        let mut index = Self::default();
        for id in tree.walk() {
            match tree.node(id) {
                FsNode::Dir(d) => {
                    index.dirs.entry(d.strong).or_insert(id);
                }
                FsNode::File(f) => {
                    index.files.entry(f.strong).or_insert(id);
                    for block in &f.blocks {
                        let bref = BlockRef {
                            file: id,
                            position: block.position,
                        };
                        index.weak.entry(block.weak).or_default().push(bref);
                        index.blocks.entry(block.strong).or_insert(bref);
                    }
                }
            }
        }
        index
    }

    pub fn file_with_strong(&self, strong: &Strong) -> Option<NodeId> {
        self.files.get(strong).copied()
    }

    pub fn dir_with_strong(&self, strong: &Strong) -> Option<NodeId> {
        self.dirs.get(strong).copied()
    }

    pub fn block_with_strong(&self, strong: &Strong) -> Option<BlockRef> {
        self.blocks.get(strong).copied()
    }

    pub fn blocks_with_weak(&self, weak: u32) -> &[BlockRef] {
        self.weak.get(&weak).map_or(&[], Vec::as_slice)
    }

    pub fn indexed_blocks(&self) -> usize {
        self.weak.values().map(Vec::len).sum()
    }
}
