use btrfs_kit::btree::iter;
use btrfs_kit::codec::Key;
use btrfs_kit::device::{BlockDevice, FileDevice};
use btrfs_kit::snapshot::{drop_snapshot_step, snapshot, DropProgress};
use btrfs_kit::structures::{item_type, BTRFS_FS_TREE_OBJECTID};
use btrfs_kit::{mkfs, open_ctree};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// inspect and manipulate a copy-on-write filesystem image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh filesystem image at `path`, truncated or extended to `size` bytes.
    Mkfs {
        path: PathBuf,
        #[arg(long, default_value_t = 256 * 1024 * 1024)]
        size: u64,
        #[arg(long, default_value_t = 4096)]
        nodesize: u32,
        #[arg(long, default_value_t = 4096)]
        sectorsize: u32,
    },
    /// Print every item of a tree in key order.
    DumpTree {
        path: PathBuf,
        #[arg(long, default_value_t = BTRFS_FS_TREE_OBJECTID)]
        objectid: u64,
    },
    /// Create a snapshot of the default subvolume under a new objectid.
    Snapshot {
        path: PathBuf,
        #[arg(long)]
        new_owner: u64,
    },
    /// Run one resumable step of deleting a snapshot's tree, up to `budget` subtrees.
    DropSnapshot {
        path: PathBuf,
        #[arg(long)]
        owner: u64,
        #[arg(long, default_value_t = 16)]
        budget: u32,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Mkfs {
            path,
            size,
            nodesize,
            sectorsize,
        } => {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(size)?;
            drop(file);
            let device = Arc::new(FileDevice::open(&path)?) as Arc<dyn BlockDevice>;
            let fs = mkfs(device, nodesize, sectorsize)?;
            log::info!("created filesystem at {} ({} bytes)", path.display(), size);
            fs.close_ctree()?;
        }
        Command::DumpTree { path, objectid } => {
            let device = Arc::new(FileDevice::open(&path)?) as Arc<dyn BlockDevice>;
            let fs = open_ctree(device)?;
            let tree = if objectid == fs.root_tree.owner {
                fs.root_tree.clone()
            } else if objectid == fs.extent_tree.owner {
                fs.extent_tree.clone()
            } else {
                fs.fs_tree(objectid)?
            };
            let mut next = Some(Key::new(0, item_type::MIN, 0));
            while let Some(key) = next {
                let found = iter::seek(&tree, key)?;
                let (found_key, data) = match found {
                    Some(pair) => pair,
                    None => break,
                };
                println!("{} len {}", found_key, data.len());
                next = iter::successor(found_key);
            }
        }
        Command::Snapshot { path, new_owner } => {
            let device = Arc::new(FileDevice::open(&path)?) as Arc<dyn BlockDevice>;
            let fs = open_ctree(device)?;
            let source = fs.fs_tree(BTRFS_FS_TREE_OBJECTID)?;
            let new_tree = snapshot(&source, &fs.alloc, new_owner)?;
            while fs.alloc.finish_pending()? {}
            fs.register_root(new_owner, &new_tree)?;
            fs.close_ctree()?;
            log::info!("snapshotted subvolume {} as {}", BTRFS_FS_TREE_OBJECTID, new_owner);
        }
        Command::DropSnapshot {
            path,
            owner,
            budget,
        } => {
            let device = Arc::new(FileDevice::open(&path)?) as Arc<dyn BlockDevice>;
            let fs = open_ctree(device)?;
            let tree = fs.fs_tree(owner)?;
            let mut progress = DropProgress::default();
            loop {
                match drop_snapshot_step(&tree, &fs.alloc, progress, budget)? {
                    Some(next) => progress = next,
                    None => break,
                }
                while fs.alloc.finish_pending()? {}
            }
            while fs.alloc.finish_pending()? {}
            fs.unregister_root(owner)?;
            fs.close_ctree()?;
            log::info!("dropped snapshot {}", owner);
        }
    }

    Ok(())
}
