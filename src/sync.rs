use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::task;
use tracing::info;

use crate::apply::{ExecReport, Executor};
use crate::error::SyncError;
use crate::index::{index_tree, AcceptAll, BlockIndex};
use crate::plan::PatchPlan;
use crate::store::{LocalStore, TreeBlockStore};
use crate::tree::Tree;

/// Outcome of a full sync run: command count, executed-command counters,
/// and every non-fatal per-path error funneled along the way.
#[derive(Debug)]
pub struct SyncReport {
    pub commands: usize,
    pub exec: ExecReport,
    pub errors: Vec<SyncError>,
}

/// Index the two trees concurrently.
async fn index_both(
    src_root: PathBuf,
    dst_root: PathBuf,
) -> Result<(Tree, Tree, Vec<SyncError>)> {
    let (src_res, dst_res) = tokio::try_join!(
        task::spawn_blocking(move || {
            let mut errs = Vec::new();
            index_tree(&src_root, &AcceptAll, &mut errs).map(|tree| (tree, errs))
        }),
        task::spawn_blocking(move || {
            let mut errs = Vec::new();
            index_tree(&dst_root, &AcceptAll, &mut errs).map(|tree| (tree, errs))
        }),
    )?;
    let (src_tree, mut errors) = src_res.context("indexing source tree")?;
    let (dst_tree, mut dst_errs) = dst_res.context("indexing destination tree")?;
    errors.append(&mut dst_errs);
    Ok((src_tree, dst_tree, errors))
}

/// Build a patch plan without touching the destination (dry run).
pub async fn plan_trees(src_root: &Path, dst_root: &Path) -> Result<PatchPlan> {
    let src_root = src_root.to_path_buf();
    let dst_root = dst_root.to_path_buf();
    let (src_tree, dst_tree, _errors) = index_both(src_root, dst_root.clone()).await?;
    task::spawn_blocking(move || {
        let dst_index = BlockIndex::build(&dst_tree);
        let local = LocalStore::new(dst_root, dst_tree, dst_index);
        Ok(PatchPlan::build(&src_tree, &local)?)
    })
    .await?
}

/// Make the destination tree a byte-exact replica of the source tree:
/// index both sides, plan, execute, then clean up relocations, propagate
/// modes, and remove unclaimed destination entries.
pub async fn sync_trees(src_root: &Path, dst_root: &Path) -> Result<SyncReport> {
    let src_root = src_root.to_path_buf();
    let dst_root = dst_root.to_path_buf();
    std::fs::create_dir_all(&dst_root)
        .with_context(|| format!("creating destination root {}", dst_root.display()))?;

    let (src_tree, dst_tree, mut errors) =
        index_both(src_root.clone(), dst_root.clone()).await?;

    task::spawn_blocking(move || {
        let src_index = BlockIndex::build(&src_tree);
        let dst_index = BlockIndex::build(&dst_tree);
        let mut local = LocalStore::new(dst_root, dst_tree, dst_index);

        let plan = PatchPlan::build(&src_tree, &local)?;
        let commands = plan.cmds.len();
        info!(commands, "executing patch plan");

        let store = TreeBlockStore::new(src_root, &src_tree, &src_index);
        let mut exec = Executor::new(plan, &mut local);
        exec.run(&store)?;
        exec.cleanup_conflicts(&mut errors);
        exec.set_mode(&src_tree, &mut errors);
        exec.clean(&mut errors);

        Ok(SyncReport {
            commands,
            exec: exec.into_report(),
            errors,
        })
    })
    .await?
}
