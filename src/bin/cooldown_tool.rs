use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tablet_cooldown::rowset::remote_segment_path;
use tablet_cooldown::tablet::remote_cooldown_meta_path;
use tablet_cooldown::{
    CooldownMeta, FileMetaStore, ReplicaId, RowsetId, SchemaHash, TabletId, TabletMetaStore,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cooldown-tool")]
#[command(about = "Inspection tooling for tablet cooldown state")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the persisted meta of one tablet as JSON
    InspectTablet {
        #[arg(long)]
        meta_dir: PathBuf,
        #[arg(long)]
        tablet_id: TabletId,
        #[arg(long)]
        schema_hash: SchemaHash,
    },
    /// List every tablet in a meta directory
    ListTablets {
        #[arg(long)]
        meta_dir: PathBuf,
    },
    /// Decode and summarize a remote cooldown meta file
    InspectCooldownMeta {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the remote layout for a tablet under a lease
    RemotePaths {
        #[arg(long)]
        tablet_id: TabletId,
        #[arg(long)]
        replica_id: ReplicaId,
        #[arg(long)]
        term: u64,
        #[arg(long)]
        rowset_id: Option<String>,
        #[arg(long, default_value_t = 0)]
        segments: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::InspectTablet {
            meta_dir,
            tablet_id,
            schema_hash,
        } => inspect_tablet(&meta_dir, tablet_id, schema_hash),
        Command::ListTablets { meta_dir } => list_tablets(&meta_dir),
        Command::InspectCooldownMeta { file } => inspect_cooldown_meta(&file),
        Command::RemotePaths {
            tablet_id,
            replica_id,
            term,
            rowset_id,
            segments,
        } => remote_paths(tablet_id, replica_id, term, rowset_id.as_deref(), segments),
    }
}

fn open_store(meta_dir: &Path) -> Result<FileMetaStore> {
    if !meta_dir.is_dir() {
        return Err(anyhow!("Meta directory '{}' does not exist", meta_dir.display()));
    }
    FileMetaStore::open(meta_dir)
        .with_context(|| format!("Failed to open meta store '{}'", meta_dir.display()))
}

fn inspect_tablet(meta_dir: &Path, tablet_id: TabletId, schema_hash: SchemaHash) -> Result<()> {
    let store = open_store(meta_dir)?;
    let meta = store
        .load(tablet_id, schema_hash)?
        .ok_or_else(|| anyhow!("Tablet {}.{} not found", tablet_id, schema_hash))?;
    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}

fn list_tablets(meta_dir: &Path) -> Result<()> {
    let store = open_store(meta_dir)?;
    let mut ids = store.list()?;
    ids.sort();
    for (tablet_id, schema_hash) in ids {
        let Some(meta) = store.load(tablet_id, schema_hash)? else {
            continue;
        };
        let remote = meta.rowsets.iter().filter(|rs| !rs.is_local()).count();
        println!(
            "{}.{} replica={} policy={} term={} owner={} rowsets={} remote={}",
            tablet_id,
            schema_hash,
            meta.replica_id,
            meta.storage_policy_id,
            meta.cooldown_conf.term,
            meta.cooldown_conf.cooldown_replica_id,
            meta.rowsets.len(),
            remote
        );
    }
    Ok(())
}

fn inspect_cooldown_meta(file: &Path) -> Result<()> {
    let raw = fs::read(file).with_context(|| format!("Failed to read '{}'", file.display()))?;
    let meta = CooldownMeta::decode(&raw)?;

    println!("Cooldown meta: {}", meta.cooldown_meta_id);
    println!(
        "Tablet: {}  Replica: {}  Term: {}",
        meta.tablet_id, meta.replica_id, meta.term
    );
    for rowset in &meta.rowsets {
        println!(
            "  {} {} rows={} segments={} resource={}",
            rowset.version,
            rowset.rowset_id,
            rowset.num_rows,
            rowset.segment_paths.len(),
            rowset.resource_id
        );
    }
    Ok(())
}

fn remote_paths(
    tablet_id: TabletId,
    replica_id: ReplicaId,
    term: u64,
    rowset_id: Option<&str>,
    segments: usize,
) -> Result<()> {
    println!(
        "{}",
        remote_cooldown_meta_path(tablet_id, replica_id, term).display()
    );
    if let Some(raw) = rowset_id {
        let id = Uuid::parse_str(raw).with_context(|| format!("Invalid rowset id '{}'", raw))?;
        let id = RowsetId::from_uuid(id);
        for idx in 0..segments {
            println!("{}", remote_segment_path(tablet_id, &id, idx).display());
        }
    }
    Ok(())
}
