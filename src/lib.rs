//! Block-level directory synchronizer.
//!
//! Transforms a destination tree into a byte-exact replica of a source tree
//! while reusing content the destination already has, even when it moved.
//! Every file and directory carries a strong content fingerprint, every
//! fixed-size block a weak rolling checksum and a strong checksum; the sync
//! itself is an ordered command sequence planned over that index.

pub mod apply;
pub mod checksum;
pub mod error;
pub mod index;
pub mod matcher;
pub mod plan;
pub mod store;
pub mod sync;
pub mod tree;

/// Fixed block size governing both indexing and matching.
pub const BLOCK_SIZE: usize = 8192;

pub use apply::{ExecReport, Executor};
pub use checksum::{RollingSum, Strong};
pub use error::{Result, SyncError};
pub use index::{index_tree, AcceptAll, BlockIndex, BlockRef, IndexFilter};
pub use matcher::{match_file, BlockMatch, FileMatch};
pub use plan::{PatchCmd, PatchPlan};
pub use store::{LocalStore, SourceBlockStore, TreeBlockStore};
pub use sync::{plan_trees, sync_trees, SyncReport};
pub use tree::{Block, EntryKind, FsNode, NodeId, Tree};
