use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::Strong;
use crate::error::{Result, SyncError};
use crate::matcher::{self, block_len, FileMatch};
use crate::store::LocalStore;
use crate::tree::{Dir, EntryKind, File, FsNode, Tree};
use crate::BLOCK_SIZE;

/// One step of a patch. The family is a closed sum dispatched by the
/// executor; its serialized form is one tagged JSON object per command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchCmd {
    /// Destination already has the right content at the right relpath.
    Keep { path: String },
    /// Destination content at `from` is wanted at `to`. The last planned
    /// use moves the entry; earlier uses copy it.
    Transfer { from: String, to: String },
    /// The entry at `path` is of the wrong kind; relocate it aside. The
    /// relocated original is deleted after the plan succeeds.
    Conflict { path: String },
    /// Create a directory that no other command materializes.
    Mkdir { path: String },
    /// Fetch a whole source file from the source store.
    SrcFileDownload {
        strong: Strong,
        path: String,
        size: u64,
    },
    /// Open the destination file and create a sibling temp truncated to
    /// `size`; both handles stay open until `ReplaceWithTemp`.
    LocalTemp {
        path: String,
        temp: String,
        size: u64,
    },
    /// Copy a range from the opened destination into the temp.
    LocalTempCopy {
        temp: String,
        local_offset: u64,
        temp_offset: u64,
        length: u64,
    },
    /// Fetch a range from the source store into the temp.
    SrcTempCopy {
        temp: String,
        strong: Strong,
        src_offset: u64,
        temp_offset: u64,
        length: u64,
    },
    /// Truncate in place; content is already a prefix-exact match.
    Resize { path: String, size: u64 },
    /// Close both handles and rename the temp over the destination.
    ReplaceWithTemp { temp: String },
}

impl fmt::Display for PatchCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep { path } => write!(f, "keep {path}"),
            Self::Transfer { from, to } => write!(f, "transfer {from} -> {to}"),
            Self::Conflict { path } => write!(f, "conflict {path}"),
            Self::Mkdir { path } => write!(f, "mkdir {path}"),
            Self::SrcFileDownload { path, size, .. } => {
                write!(f, "download {path} ({size} bytes)")
            }
            Self::LocalTemp { path, temp, size } => {
                write!(f, "stage {temp} ({size} bytes) for {path}")
            }
            Self::LocalTempCopy {
                temp,
                local_offset,
                temp_offset,
                length,
            } => write!(
                f,
                "local-copy {length}@{local_offset} -> {temp}@{temp_offset}"
            ),
            Self::SrcTempCopy {
                temp,
                src_offset,
                temp_offset,
                length,
                ..
            } => write!(
                f,
                "source-copy {length}@{src_offset} -> {temp}@{temp_offset}"
            ),
            Self::Resize { path, size } => write!(f, "resize {path} to {size}"),
            Self::ReplaceWithTemp { temp } => write!(f, "replace with {temp}"),
        }
    }
}

/// An ordered command sequence over a source tree and a destination store.
#[derive(Debug)]
pub struct PatchPlan {
    pub cmds: Vec<PatchCmd>,
    /// Destination relpath -> number of planned uses as a transfer source.
    pub reloc_refs: HashMap<String, usize>,
    /// Destination relpaths not claimed by any source path; removed by the
    /// executor's clean pass.
    pub dst_unmatched: BTreeMap<String, EntryKind>,
}

impl PatchPlan {
    /// Diff the source tree against the destination store.
    pub fn build(src: &Tree, local: &LocalStore) -> Result<Self> {
        let mut planner = Planner {
            src,
            local,
            cmds: Vec::new(),
            reloc_refs: HashMap::new(),
            dst_unmatched: BTreeMap::new(),
            temp_seq: 0,
        };
        planner.run()?;
        debug!(
            commands = planner.cmds.len(),
            unmatched = planner.dst_unmatched.len(),
            "patch plan built"
        );
        Ok(Self {
            cmds: planner.cmds,
            reloc_refs: planner.reloc_refs,
            dst_unmatched: planner.dst_unmatched,
        })
    }
}

struct Planner<'a> {
    src: &'a Tree,
    local: &'a LocalStore,
    cmds: Vec<PatchCmd>,
    reloc_refs: HashMap<String, usize>,
    dst_unmatched: BTreeMap<String, EntryKind>,
    temp_seq: usize,
}

impl Planner<'_> {
    fn run(&mut self) -> Result<()> {
        // Destination first: everything starts out unclaimed.
        let dst = self.local.tree();
        for id in dst.walk() {
            if id == dst.root() {
                continue;
            }
            self.dst_unmatched
                .insert(dst.rel_path(id), dst.node(id).kind());
        }

        // Source walk, depth-first. A file is a leaf at this level;
        // directories are descended whether or not they hit.
        for id in self.src.walk() {
            let rel = self.src.rel_path(id);
            // The source claims this path even when the content differs.
            self.dst_unmatched.remove(&rel);
            match self.src.node(id) {
                FsNode::File(file) => self.plan_file(file, rel)?,
                FsNode::Dir(dir) => self.plan_dir(dir, rel)?,
            }
        }
        Ok(())
    }

    fn plan_file(&mut self, file: &File, rel: String) -> Result<()> {
        // Content hit: the destination already has these bytes somewhere.
        if let Some(dst_id) = self.local.index().file_with_strong(&file.strong) {
            let from = self.local.tree().rel_path(dst_id);
            *self.reloc_refs.entry(from.clone()).or_insert(0) += 1;
            if from == rel {
                self.cmds.push(PatchCmd::Keep { path: rel });
            } else {
                // The wanted path may hold an entry of the wrong kind; it
                // must move aside before the transfer lands there.
                if let Ok(meta) = fs::symlink_metadata(self.local.resolve(&rel)) {
                    if !meta.is_file() {
                        self.cmds.push(PatchCmd::Conflict { path: rel.clone() });
                    }
                }
                self.cmds.push(PatchCmd::Transfer { from, to: rel });
            }
            return Ok(());
        }

        let abs = self.local.resolve(&rel);
        match fs::symlink_metadata(&abs) {
            Err(e) if path_absent(&e) => self.push_download(file, rel),
            Err(e) => return Err(SyncError::io("stat", abs, e)),
            Ok(meta) if !meta.is_file() => {
                self.cmds.push(PatchCmd::Conflict { path: rel.clone() });
                self.push_download(file, rel);
            }
            Ok(meta) => {
                let fm = matcher::match_file(file, &abs)?;
                self.plan_block_patch(file, rel, &fm, meta.len());
            }
        }
        Ok(())
    }

    fn push_download(&mut self, file: &File, rel: String) {
        self.cmds.push(PatchCmd::SrcFileDownload {
            strong: file.strong,
            path: rel,
            size: file.size,
        });
    }

    fn plan_block_patch(&mut self, file: &File, rel: String, fm: &FileMatch, dst_len: u64) {
        let block = BLOCK_SIZE as u64;
        let unmatched: Vec<_> = fm
            .not_matched()
            .into_iter()
            .filter(|r| r.end > r.start)
            .collect();
        let all_home = fm
            .matches
            .iter()
            .all(|m| m.dst_offset == m.src_position as u64 * block);

        if file.size > 0 && unmatched.is_empty() && all_home && dst_len > file.size {
            // The destination starts with exactly the source content;
            // only the tail has to go.
            self.cmds.push(PatchCmd::Resize {
                path: rel,
                size: file.size,
            });
            return;
        }

        self.temp_seq += 1;
        let temp = format!("{rel}._sync{}", self.temp_seq);
        self.cmds.push(PatchCmd::LocalTemp {
            path: rel,
            temp: temp.clone(),
            size: file.size,
        });
        for m in &fm.matches {
            self.cmds.push(PatchCmd::LocalTempCopy {
                temp: temp.clone(),
                local_offset: m.dst_offset,
                temp_offset: m.src_position as u64 * block,
                length: block_len(file.size, m.src_position),
            });
        }
        for range in unmatched {
            self.cmds.push(PatchCmd::SrcTempCopy {
                temp: temp.clone(),
                strong: file.strong,
                src_offset: range.start,
                temp_offset: range.start,
                length: range.end - range.start,
            });
        }
        self.cmds.push(PatchCmd::ReplaceWithTemp { temp });
    }

    fn plan_dir(&mut self, dir: &Dir, rel: String) -> Result<()> {
        if rel.is_empty() {
            // The destination root; the driver guarantees it exists.
            return Ok(());
        }
        let childless = dir.subdirs.is_empty() && dir.files.is_empty();
        let abs = self.local.resolve(&rel);
        match fs::symlink_metadata(&abs) {
            Err(e) if path_absent(&e) => {
                if childless {
                    self.cmds.push(PatchCmd::Mkdir { path: rel });
                }
                // A non-empty directory is materialized by its children.
            }
            Err(e) => return Err(SyncError::io("stat", abs, e)),
            Ok(meta) if !meta.is_dir() => {
                self.cmds.push(PatchCmd::Conflict { path: rel.clone() });
                if childless {
                    self.cmds.push(PatchCmd::Mkdir { path: rel });
                }
            }
            Ok(_) => {}
        }
        Ok(())
    }
}

/// A stat that fails because the path, or a directory on the way to it,
/// does not exist.
fn path_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}
