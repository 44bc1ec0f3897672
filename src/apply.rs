use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::plan::{PatchCmd, PatchPlan};
use crate::store::{LocalStore, SourceBlockStore};
use crate::tree::{EntryKind, Tree};

/// Counters for one executed plan.
#[derive(Debug, Default)]
pub struct ExecReport {
    pub kept: usize,
    pub transferred: usize,
    pub downloaded: usize,
    pub patched: usize,
    pub resized: usize,
    pub dirs_created: usize,
    pub conflicts: usize,
    pub cleaned_files: usize,
    pub cleaned_dirs: usize,
}

/// The two handles held between `LocalTemp` and `ReplaceWithTemp`.
struct TempStage {
    temp_rel: String,
    dst_rel: String,
    dst: fs::File,
    temp: fs::File,
    dst_abs: PathBuf,
    temp_abs: PathBuf,
}

/// Applies a [`PatchPlan`] command by command.
///
/// Execution is strictly sequential: commands share the staging handles and
/// the store's relocation map. The first failing command aborts the plan
/// with [`SyncError::CommandFailed`]; partial work (staged temps, relocated
/// originals) may remain. After a fully successful `run`, call
/// `cleanup_conflicts`, `set_mode`, and `clean`, in that order.
pub struct Executor<'a> {
    plan: PatchPlan,
    local: &'a mut LocalStore,
    stage: Option<TempStage>,
    relocated: Vec<String>,
    report: ExecReport,
}

impl<'a> Executor<'a> {
    pub fn new(plan: PatchPlan, local: &'a mut LocalStore) -> Self {
        Self {
            plan,
            local,
            stage: None,
            relocated: Vec::new(),
            report: ExecReport::default(),
        }
    }

    pub fn run(&mut self, src: &dyn SourceBlockStore) -> Result<()> {
        let cmds = std::mem::take(&mut self.plan.cmds);
        for cmd in &cmds {
            debug!(%cmd, "exec");
            self.exec_cmd(cmd, src)
                .map_err(|e| SyncError::CommandFailed {
                    cmd: cmd.to_string(),
                    source: Box::new(e),
                })?;
        }
        self.plan.cmds = cmds;
        if let Some(stage) = &self.stage {
            return Err(SyncError::PlanMalformed(format!(
                "plan ended with open stage {}",
                stage.temp_rel
            )));
        }
        Ok(())
    }

    fn exec_cmd(&mut self, cmd: &PatchCmd, src: &dyn SourceBlockStore) -> Result<()> {
        match cmd {
            PatchCmd::Keep { .. } => {
                self.report.kept += 1;
            }

            PatchCmd::Transfer { from, to } => {
                let refs = self.plan.reloc_refs.get_mut(from).ok_or_else(|| {
                    SyncError::PlanMalformed(format!(
                        "transfer from {from} without a reference count"
                    ))
                })?;
                if *refs == 0 {
                    return Err(SyncError::PlanMalformed(format!(
                        "reference count for {from} went negative"
                    )));
                }
                *refs -= 1;
                let remaining = *refs;

                let from_abs = self.local.resolve(from);
                let to_abs = self.local.dest_path(to);
                if from_abs != to_abs {
                    self.shield(to)?;
                    if let Some(parent) = to_abs.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| SyncError::io("mkdir", parent, e))?;
                    }
                    if remaining == 0 {
                        // Last planned use: move the entry into place.
                        fs::rename(&from_abs, &to_abs)
                            .map_err(|e| SyncError::io("rename", &from_abs, e))?;
                    } else {
                        fs::copy(&from_abs, &to_abs)
                            .map_err(|e| SyncError::io("copy", &from_abs, e))?;
                    }
                }
                self.report.transferred += 1;
            }

            PatchCmd::Conflict { path } => {
                self.local.relocate(path)?;
                self.relocated.push(path.clone());
                self.report.conflicts += 1;
            }

            PatchCmd::Mkdir { path } => {
                let abs = self.local.dest_path(path);
                fs::create_dir_all(&abs).map_err(|e| SyncError::io("mkdir", abs, e))?;
                self.report.dirs_created += 1;
            }

            PatchCmd::SrcFileDownload { strong, path, size } => {
                self.shield(path)?;
                let abs = self.local.dest_path(path);
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent).map_err(|e| SyncError::io("mkdir", parent, e))?;
                }
                let mut file =
                    fs::File::create(&abs).map_err(|e| SyncError::io("create", &abs, e))?;
                let written = src.read_into(strong, 0, *size, &mut file)?;
                if written != *size {
                    return Err(short_read(&abs, written, *size));
                }
                self.report.downloaded += 1;
            }

            PatchCmd::LocalTemp { path, temp, size } => {
                if let Some(stage) = &self.stage {
                    return Err(SyncError::PlanMalformed(format!(
                        "stage {} is still open",
                        stage.temp_rel
                    )));
                }
                let dst_abs = self.local.dest_path(path);
                let dst =
                    fs::File::open(&dst_abs).map_err(|e| SyncError::io("open", &dst_abs, e))?;
                let temp_abs = self.local.dest_path(temp);
                let tmp = fs::File::create(&temp_abs)
                    .map_err(|e| SyncError::io("create", &temp_abs, e))?;
                tmp.set_len(*size)
                    .map_err(|e| SyncError::io("truncate", &temp_abs, e))?;
                self.stage = Some(TempStage {
                    temp_rel: temp.clone(),
                    dst_rel: path.clone(),
                    dst,
                    temp: tmp,
                    dst_abs,
                    temp_abs,
                });
            }

            PatchCmd::LocalTempCopy {
                temp,
                local_offset,
                temp_offset,
                length,
            } => {
                let stage = self.stage_for(temp)?;
                copy_range(&stage.dst, &stage.temp, *local_offset, *temp_offset, *length)
                    .map_err(|e| SyncError::io("copy", stage.temp_abs.clone(), e))?;
            }

            PatchCmd::SrcTempCopy {
                temp,
                strong,
                src_offset,
                temp_offset,
                length,
            } => {
                let stage = self.stage_for(temp)?;
                let mut out = RangeWriter {
                    file: &stage.temp,
                    pos: *temp_offset,
                };
                let written = src.read_into(strong, *src_offset, *length, &mut out)?;
                if written != *length {
                    return Err(short_read(&stage.temp_abs, written, *length));
                }
            }

            PatchCmd::Resize { path, size } => {
                self.shield(path)?;
                let abs = self.local.dest_path(path);
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&abs)
                    .map_err(|e| SyncError::io("open", &abs, e))?;
                file.set_len(*size)
                    .map_err(|e| SyncError::io("truncate", &abs, e))?;
                self.report.resized += 1;
            }

            PatchCmd::ReplaceWithTemp { temp } => {
                let stage = match self.stage.take() {
                    Some(stage) if stage.temp_rel == *temp => stage,
                    Some(stage) => {
                        return Err(SyncError::PlanMalformed(format!(
                            "replace names temp {temp} but stage {} is open",
                            stage.temp_rel
                        )))
                    }
                    None => {
                        return Err(SyncError::PlanMalformed(format!(
                            "replace with {temp} without a staged temp"
                        )))
                    }
                };
                let TempStage {
                    dst_rel,
                    dst,
                    temp: tmp,
                    dst_abs,
                    temp_abs,
                    ..
                } = stage;
                drop(dst);
                drop(tmp);
                self.shield(&dst_rel)?;
                // A single rename over the existing destination; no window
                // where the destination is missing.
                fs::rename(&temp_abs, &dst_abs)
                    .map_err(|e| SyncError::io("rename", &temp_abs, e))?;
                self.report.patched += 1;
            }
        }
        Ok(())
    }

    fn stage_for(&mut self, temp: &str) -> Result<&mut TempStage> {
        match &self.stage {
            Some(stage) if stage.temp_rel == temp => {}
            Some(stage) => {
                return Err(SyncError::PlanMalformed(format!(
                    "command names temp {temp} but stage {} is open",
                    stage.temp_rel
                )))
            }
            None => {
                return Err(SyncError::PlanMalformed(format!(
                    "no open stage for temp {temp}"
                )))
            }
        }
        Ok(self.stage.as_mut().unwrap())
    }

    /// Preserve a path's current content at a reloc name when later
    /// commands still read it and the path is about to be overwritten.
    fn shield(&mut self, rel: &str) -> Result<()> {
        let remaining = self.plan.reloc_refs.get(rel).copied().unwrap_or(0);
        if remaining == 0 || self.local.is_shadowed(rel) {
            return Ok(());
        }
        if !self.local.dest_path(rel).exists() {
            return Ok(());
        }
        self.local.relocate_copy(rel)?;
        self.relocated.push(rel.to_owned());
        Ok(())
    }

    /// Delete every relocated original. Run only after a fully successful
    /// `run`; per-path failures are funneled and non-fatal.
    pub fn cleanup_conflicts(&mut self, errs: &mut Vec<SyncError>) {
        for rel in std::mem::take(&mut self.relocated) {
            if let Err(e) = self.local.cleanup_reloc(&rel) {
                warn!(path = %rel, error = %e, "failed to remove relocated entry");
                errs.push(e);
            }
        }
    }

    /// Chmod every resolved destination path to the source's mode bits.
    /// Per-path errors are funneled and non-fatal.
    pub fn set_mode(&self, src: &Tree, errs: &mut Vec<SyncError>) {
        for id in src.walk() {
            let rel = src.rel_path(id);
            let abs = self.local.resolve(&rel);
            let mode = src.node(id).mode() & 0o7777;
            if let Err(e) = fs::set_permissions(&abs, fs::Permissions::from_mode(mode)) {
                warn!(path = %abs.display(), error = %e, "chmod failed");
                errs.push(SyncError::io("chmod", abs, e));
            }
        }
    }

    /// Remove every destination path no source path claimed: files first,
    /// then directories deepest-first. Already-missing paths are fine (a
    /// moved transfer source is already gone).
    pub fn clean(&mut self, errs: &mut Vec<SyncError>) {
        let unmatched = std::mem::take(&mut self.plan.dst_unmatched);
        let mut dirs: Vec<String> = Vec::new();
        for (rel, kind) in unmatched {
            match kind {
                EntryKind::File => {
                    let abs = self.local.dest_path(&rel);
                    match fs::remove_file(&abs) {
                        Ok(()) => self.report.cleaned_files += 1,
                        Err(e) if gone(&e) => {}
                        Err(e) => errs.push(SyncError::io("remove", abs, e)),
                    }
                }
                EntryKind::Dir => dirs.push(rel),
            }
        }
        dirs.sort();
        dirs.reverse();
        for rel in dirs {
            let abs = self.local.dest_path(&rel);
            match fs::remove_dir(&abs) {
                Ok(()) => self.report.cleaned_dirs += 1,
                Err(e) if gone(&e) => {}
                Err(e) => errs.push(SyncError::io("remove", abs, e)),
            }
        }
    }

    pub fn report(&self) -> &ExecReport {
        &self.report
    }

    pub fn into_report(self) -> ExecReport {
        self.report
    }
}

/// The path is no longer there, or an ancestor was replaced by a file;
/// either way there is nothing left to remove.
fn gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn short_read(path: &std::path::Path, written: u64, wanted: u64) -> SyncError {
    SyncError::io(
        "read",
        path,
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short source read: {written} of {wanted} bytes"),
        ),
    )
}

fn copy_range(
    from: &fs::File,
    to: &fs::File,
    from_off: u64,
    to_off: u64,
    length: u64,
) -> io::Result<()> {
    let cap = length.clamp(1, 256 * 1024) as usize;
    let mut buf = vec![0u8; cap];
    let mut done = 0u64;
    while done < length {
        let chunk = ((length - done) as usize).min(buf.len());
        from.read_exact_at(&mut buf[..chunk], from_off + done)?;
        to.write_all_at(&buf[..chunk], to_off + done)?;
        done += chunk as u64;
    }
    Ok(())
}

/// Positioned writer over the staged temp file, used as the sink for
/// source-store range reads.
struct RangeWriter<'f> {
    file: &'f fs::File,
    pos: u64,
}

impl Write for RangeWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all_at(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
