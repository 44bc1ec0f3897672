use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use blocksync::index::{index_tree, AcceptAll, BlockIndex};
use blocksync::plan::{PatchCmd, PatchPlan};
use blocksync::store::LocalStore;
use blocksync::sync::{sync_trees, SyncReport};
use blocksync::tree::Tree;
use blocksync::{Strong, BLOCK_SIZE};
use tempfile::TempDir;

fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, content) in files {
        let full = root.join(rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

fn index_of(root: &Path) -> Tree {
    let mut errs = Vec::new();
    let tree = index_tree(root, &AcceptAll, &mut errs).unwrap();
    assert!(errs.is_empty(), "index errors: {errs:?}");
    tree
}

fn root_strong(root: &Path) -> Strong {
    let tree = index_of(root);
    tree.node(tree.root()).strong()
}

fn assert_replica(src: &Path, dst: &Path) {
    assert_eq!(root_strong(src), root_strong(dst), "trees differ after sync");
}

fn build_plan(src_root: &Path, dst_root: &Path) -> PatchPlan {
    let src = index_of(src_root);
    let dst = index_of(dst_root);
    let dst_index = BlockIndex::build(&dst);
    let local = LocalStore::new(dst_root, dst, dst_index);
    PatchPlan::build(&src, &local).unwrap()
}

async fn run_sync(src: &Path, dst: &Path) -> SyncReport {
    let report = sync_trees(src, dst).await.unwrap();
    assert!(report.errors.is_empty(), "sync errors: {:?}", report.errors);
    report
}

/// Every planned use of a destination path must equal its reference count.
fn assert_ref_counts_consistent(plan: &PatchPlan) {
    for (path, &count) in &plan.reloc_refs {
        let uses = plan
            .cmds
            .iter()
            .filter(|cmd| match cmd {
                PatchCmd::Transfer { from, .. } => from == path,
                PatchCmd::Keep { path: p } => p == path,
                _ => false,
            })
            .count();
        assert_eq!(uses, count, "reference count mismatch for {path}");
    }
}

#[tokio::test]
async fn identical_file_is_kept_in_place() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let content = seeded_bytes(42, 65537);
    write_tree(src.path(), &[("foo/bar", &content)]);
    write_tree(dst.path(), &[("foo/bar", &content)]);

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(
        plan.cmds,
        [PatchCmd::Keep {
            path: "foo/bar".to_owned()
        }]
    );
    assert_ref_counts_consistent(&plan);

    let report = run_sync(src.path(), dst.path()).await;
    assert_eq!(report.exec.kept, 1);
    assert_eq!(report.exec.transferred, 0);
    assert_eq!(report.exec.downloaded, 0);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn appended_content_reuses_local_blocks() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let old = seeded_bytes(42, 65537);
    let mut new = old.clone();
    new.extend_from_slice(&seeded_bytes(43, 65537));
    write_tree(src.path(), &[("foo/bar", &new)]);
    write_tree(dst.path(), &[("foo/bar", &old)]);

    let plan = build_plan(src.path(), dst.path());

    let stages: Vec<u64> = plan
        .cmds
        .iter()
        .filter_map(|cmd| match cmd {
            PatchCmd::LocalTemp { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(stages, [131074]);

    let block = BLOCK_SIZE as u64;
    let copies: Vec<(u64, u64, u64)> = plan
        .cmds
        .iter()
        .filter_map(|cmd| match cmd {
            PatchCmd::LocalTempCopy {
                local_offset,
                temp_offset,
                length,
                ..
            } => Some((*local_offset, *temp_offset, *length)),
            _ => None,
        })
        .collect();
    let expected: Vec<(u64, u64, u64)> =
        (0..8).map(|i| (i * block, i * block, block)).collect();
    assert_eq!(copies, expected);

    let fetches: Vec<(u64, u64, u64)> = plan
        .cmds
        .iter()
        .filter_map(|cmd| match cmd {
            PatchCmd::SrcTempCopy {
                src_offset,
                temp_offset,
                length,
                ..
            } => Some((*src_offset, *temp_offset, *length)),
            _ => None,
        })
        .collect();
    assert_eq!(fetches, [(65536, 65536, 65538)]);

    assert!(plan
        .cmds
        .iter()
        .any(|c| matches!(c, PatchCmd::ReplaceWithTemp { .. })));
    assert_eq!(plan.cmds.len(), 11);

    run_sync(src.path(), dst.path()).await;
    assert_eq!(fs::read(dst.path().join("foo/bar")).unwrap(), new);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn renamed_file_becomes_a_single_transfer() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let content = seeded_bytes(12, 30000);
    write_tree(src.path(), &[("foo/bar", &content)]);
    write_tree(dst.path(), &[("foo/baz", &content)]);

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(
        plan.cmds,
        [PatchCmd::Transfer {
            from: "foo/baz".to_owned(),
            to: "foo/bar".to_owned(),
        }]
    );
    assert_ref_counts_consistent(&plan);

    let report = run_sync(src.path(), dst.path()).await;
    assert_eq!(report.exec.transferred, 1);
    assert_eq!(report.exec.downloaded, 0);
    assert!(!dst.path().join("foo/baz").exists());
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn kind_conflict_relocates_and_reuses_the_original() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let small = seeded_bytes(7, 99);
    let big = seeded_bytes(42, 65537);
    write_tree(
        src.path(),
        &[
            ("foo/gloo/bloo", small.as_slice()),
            ("foo/gloo/groo/snoo/bar", big.as_slice()),
        ],
    );
    // The destination has a *file* where the source wants a directory,
    // holding exactly the content wanted at foo/gloo/bloo.
    write_tree(dst.path(), &[("foo/gloo", small.as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    let conflict_at = plan
        .cmds
        .iter()
        .position(|c| {
            matches!(c, PatchCmd::Conflict { path } if path == "foo/gloo")
        })
        .expect("conflict planned");
    let transfer_at = plan
        .cmds
        .iter()
        .position(|c| {
            matches!(c, PatchCmd::Transfer { from, to }
                if from == "foo/gloo" && to == "foo/gloo/bloo")
        })
        .expect("transfer from the relocated original planned");
    assert!(conflict_at < transfer_at);
    assert!(plan.cmds.iter().any(|c| {
        matches!(c, PatchCmd::SrcFileDownload { path, .. } if path == "foo/gloo/groo/snoo/bar")
    }));
    assert_ref_counts_consistent(&plan);

    let report = run_sync(src.path(), dst.path()).await;
    assert_eq!(report.exec.conflicts, 1);
    assert_replica(src.path(), dst.path());

    // The relocated original must not survive a successful sync.
    for entry in fs::read_dir(dst.path()).unwrap() {
        let name = entry.unwrap().file_name();
        assert!(
            !name.to_string_lossy().starts_with("_reloc"),
            "leftover relocation: {name:?}"
        );
    }
}

#[tokio::test]
async fn shared_source_is_copied_then_consumed() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let content = seeded_bytes(5, 300);
    write_tree(
        src.path(),
        &[("foo/bar", content.as_slice()), ("foo/baz", content.as_slice())],
    );
    write_tree(
        dst.path(),
        &[("foo/baz", content.as_slice()), ("foo/blop", content.as_slice())],
    );

    let plan = build_plan(src.path(), dst.path());
    // One destination entry serves both source paths.
    assert_eq!(plan.reloc_refs.get("foo/baz"), Some(&2));
    assert_ref_counts_consistent(&plan);

    let transfers = plan
        .cmds
        .iter()
        .filter(|c| matches!(c, PatchCmd::Transfer { .. }))
        .count();
    let keeps = plan
        .cmds
        .iter()
        .filter(|c| matches!(c, PatchCmd::Keep { .. }))
        .count();
    assert_eq!((transfers, keeps), (1, 1));

    run_sync(src.path(), dst.path()).await;
    assert_eq!(fs::read(dst.path().join("foo/bar")).unwrap(), content);
    assert_eq!(fs::read(dst.path().join("foo/baz")).unwrap(), content);
    assert!(!dst.path().join("foo/blop").exists());
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn modes_propagate_to_the_destination() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("gear/bin", b"tool bytes".as_slice())]);
    fs::set_permissions(src.path().join("gear"), fs::Permissions::from_mode(0o711)).unwrap();
    fs::set_permissions(
        src.path().join("gear/bin"),
        fs::Permissions::from_mode(0o765),
    )
    .unwrap();

    run_sync(src.path(), dst.path()).await;

    let dir_mode = fs::metadata(dst.path().join("gear")).unwrap().permissions().mode();
    let file_mode = fs::metadata(dst.path().join("gear/bin"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o7777, 0o711);
    assert_eq!(file_mode & 0o7777, 0o765);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn identical_trees_plan_only_keeps() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let files: &[(&str, &[u8])] = &[
        ("a.txt", b"alpha"),
        ("sub/b.txt", b"beta"),
        ("sub/deep/c.bin", &seeded_bytes(3, 20000)),
    ];
    write_tree(src.path(), files);
    write_tree(dst.path(), files);

    let plan = build_plan(src.path(), dst.path());
    assert!(plan.cmds.iter().all(|c| matches!(c, PatchCmd::Keep { .. })));
    assert_eq!(plan.cmds.len(), 3);
    assert!(plan.dst_unmatched.is_empty());
}

#[tokio::test]
async fn round_trip_restores_the_previous_tree() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    let shared = seeded_bytes(21, 40000);
    write_tree(
        a.path(),
        &[
            ("docs/readme", b"version one".as_slice()),
            ("data/blob", shared.as_slice()),
            ("keep", b"unchanged".as_slice()),
        ],
    );
    write_tree(
        b.path(),
        &[
            // The blob content moves, the readme changes, a file appears.
            ("archive/blob", shared.as_slice()),
            ("docs/readme", b"version two".as_slice()),
            ("keep", b"unchanged".as_slice()),
            ("new/extra", seeded_bytes(22, 500).as_slice()),
        ],
    );

    run_sync(a.path(), dst.path()).await;
    assert_replica(a.path(), dst.path());

    run_sync(b.path(), dst.path()).await;
    assert_replica(b.path(), dst.path());

    run_sync(a.path(), dst.path()).await;
    assert_replica(a.path(), dst.path());
}

#[tokio::test]
async fn empty_source_file_downloads_zero_bytes() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("empty", b"".as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(
        plan.cmds,
        [PatchCmd::SrcFileDownload {
            strong: Strong::of(b""),
            path: "empty".to_owned(),
            size: 0,
        }]
    );

    run_sync(src.path(), dst.path()).await;
    assert_eq!(fs::metadata(dst.path().join("empty")).unwrap().len(), 0);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn empty_source_file_replaces_without_copies() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("empty", b"".as_slice())]);
    write_tree(dst.path(), &[("empty", b"junk bytes".as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(plan.cmds.len(), 2, "plan: {:?}", plan.cmds);
    assert!(matches!(&plan.cmds[0], PatchCmd::LocalTemp { size: 0, .. }));
    assert!(matches!(&plan.cmds[1], PatchCmd::ReplaceWithTemp { .. }));

    run_sync(src.path(), dst.path()).await;
    assert_eq!(fs::metadata(dst.path().join("empty")).unwrap().len(), 0);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn prefix_exact_destination_is_resized_in_place() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let content = seeded_bytes(9, BLOCK_SIZE);
    let mut longer = content.clone();
    longer.extend_from_slice(b"tail");
    write_tree(src.path(), &[("blob", content.as_slice())]);
    write_tree(dst.path(), &[("blob", longer.as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(
        plan.cmds,
        [PatchCmd::Resize {
            path: "blob".to_owned(),
            size: BLOCK_SIZE as u64,
        }]
    );

    let report = run_sync(src.path(), dst.path()).await;
    assert_eq!(report.exec.resized, 1);
    assert_eq!(fs::read(dst.path().join("blob")).unwrap(), content);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn swapped_files_sync_correctly() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let x = seeded_bytes(31, 12000);
    let y = seeded_bytes(32, 9000);
    write_tree(src.path(), &[("a", x.as_slice()), ("b", y.as_slice())]);
    write_tree(dst.path(), &[("a", y.as_slice()), ("b", x.as_slice())]);

    run_sync(src.path(), dst.path()).await;
    assert_eq!(fs::read(dst.path().join("a")).unwrap(), x);
    assert_eq!(fs::read(dst.path().join("b")).unwrap(), y);
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn directory_where_file_wanted_is_relocated() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("thing", b"now a file".as_slice())]);
    write_tree(dst.path(), &[("thing/inner", b"old child".as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    assert!(plan
        .cmds
        .iter()
        .any(|c| matches!(c, PatchCmd::Conflict { path } if path == "thing")));

    run_sync(src.path(), dst.path()).await;
    assert!(dst.path().join("thing").is_file());
    assert_eq!(fs::read(dst.path().join("thing")).unwrap(), b"now a file");
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn empty_source_directory_is_created() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("hollow/nested")).unwrap();
    write_tree(src.path(), &[("data", b"payload".as_slice())]);

    let plan = build_plan(src.path(), dst.path());
    assert!(plan
        .cmds
        .iter()
        .any(|c| matches!(c, PatchCmd::Mkdir { path } if path == "hollow/nested")));

    run_sync(src.path(), dst.path()).await;
    assert!(dst.path().join("hollow/nested").is_dir());
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn unclaimed_destination_entries_are_cleaned() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = seeded_bytes(17, 5000);
    write_tree(src.path(), &[("keep", data.as_slice())]);
    write_tree(
        dst.path(),
        &[
            ("keep", data.as_slice()),
            ("junk/a", b"gone".as_slice()),
            ("junk/deep/b", b"gone too".as_slice()),
        ],
    );

    let report = run_sync(src.path(), dst.path()).await;
    assert!(report.exec.cleaned_files >= 2);
    assert!(!dst.path().join("junk").exists());
    assert_replica(src.path(), dst.path());
}

#[tokio::test]
async fn mode_only_change_keeps_content_and_fixes_mode() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("bin", b"same bytes".as_slice())]);
    write_tree(dst.path(), &[("bin", b"same bytes".as_slice())]);
    fs::set_permissions(src.path().join("bin"), fs::Permissions::from_mode(0o700)).unwrap();
    fs::set_permissions(dst.path().join("bin"), fs::Permissions::from_mode(0o644)).unwrap();

    let plan = build_plan(src.path(), dst.path());
    assert_eq!(
        plan.cmds,
        [PatchCmd::Keep {
            path: "bin".to_owned()
        }]
    );

    run_sync(src.path(), dst.path()).await;
    let mode = fs::metadata(dst.path().join("bin")).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o700);
}
