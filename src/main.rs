use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blocksync::index::{index_tree, AcceptAll, BlockIndex};
use blocksync::sync::{plan_trees, sync_trees};

#[derive(Parser)]
#[command(name = "blocksync", about = "Block-level directory synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a tree and print its content fingerprint
    Index {
        /// Path to the tree root
        path: PathBuf,
        /// Print one line per indexed entry
        #[arg(long)]
        list: bool,
    },
    /// Print the patch plan as JSON lines without touching the destination
    Plan {
        /// Path to the source tree
        #[arg(long)]
        src: PathBuf,
        /// Path to the destination tree
        #[arg(long)]
        dst: PathBuf,
    },
    /// Make the destination a byte-exact replica of the source
    Sync {
        /// Path to the source tree
        #[arg(long)]
        src: PathBuf,
        /// Path to the destination tree
        #[arg(long)]
        dst: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { path, list } => {
            let mut errs = Vec::new();
            let tree = index_tree(&path, &AcceptAll, &mut errs)?;
            let index = BlockIndex::build(&tree);

            if list {
                for id in tree.walk() {
                    let node = tree.node(id);
                    let kind = if node.is_dir() { 'd' } else { 'f' };
                    let rel = tree.rel_path(id);
                    let rel = if rel.is_empty() { "." } else { rel.as_str() };
                    println!("{}  {kind}  {rel}", node.strong());
                }
            }
            for err in &errs {
                eprintln!("warning: {err}");
            }
            println!("root: {}", tree.node(tree.root()).strong());
            println!("  Entries indexed: {}", tree.len());
            println!("  Blocks indexed: {}", index.indexed_blocks());
        }
        Commands::Plan { src, dst } => {
            let plan = plan_trees(&src, &dst).await?;
            for cmd in &plan.cmds {
                println!("{}", serde_json::to_string(cmd)?);
            }
        }
        Commands::Sync { src, dst } => {
            println!("Syncing...");
            println!("  Source: {}", src.display());
            println!("  Destination: {}", dst.display());

            let start = Instant::now();
            let report = sync_trees(&src, &dst).await?;
            let elapsed = start.elapsed();

            for err in &report.errors {
                eprintln!("warning: {err}");
            }
            println!("\nSync finished!");
            println!("  Commands executed: {}", report.commands);
            println!("  Files kept in place: {}", report.exec.kept);
            println!("  Files transferred locally: {}", report.exec.transferred);
            println!("  Files patched from blocks: {}", report.exec.patched);
            println!("  Files downloaded: {}", report.exec.downloaded);
            println!("  Files resized: {}", report.exec.resized);
            println!("  Conflicts relocated: {}", report.exec.conflicts);
            println!(
                "  Leftovers removed: {}",
                report.exec.cleaned_files + report.exec.cleaned_dirs
            );
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
