#![forbid(unsafe_code)]
#![allow(clippy::too_many_lines)]

//! Thin `clap` front end over the library: dispatches each subcommand to the
//! matching `pbackup::pipeline` function and maps the resulting error's
//! severity to the process exit code (§6.4, §7).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pbackup::catalog::{BackupId, BackupMode};
use pbackup::config::CliOverrides;
use pbackup::errors::{BackupError, Result};
use pbackup::page::CompressAlgorithm;
use pbackup::pipeline::{self, BackupRequest, IncrementalRestoreMode, SetBackupFields};

#[derive(Parser, Debug)]
#[command(name = "pbackup", version, about = "Page-level backup/restore catalog manager", long_about = None)]
struct Cli {
    /// Root of the backup catalog (defaults to `PBACKUP_CATALOG` or `./pbackup-catalog`).
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// Emit machine-readable JSON instead of a human-readable table.
    #[arg(long, global = true, conflicts_with = "plain")]
    json: bool,
    /// Emit minimal plain-text output.
    #[arg(long, global = true, conflicts_with = "json")]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Lay down the catalog's top-level directories.
    Init,
    /// Register a new instance in the catalog.
    AddInstance {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        pgdata: Option<PathBuf>,
    },
    /// Remove an instance and all of its backups/WAL archive.
    DelInstance {
        #[arg(long)]
        instance: String,
    },
    /// Take a backup.
    Backup {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        pgdata: PathBuf,
        #[arg(long, default_value = "full")]
        backup_mode: String,
        #[arg(long)]
        compress_algorithm: Option<String>,
        #[arg(long)]
        compress_level: Option<i32>,
        #[arg(long)]
        note: Option<String>,
        /// Treat ENOSPC while taking the exclusive lock as "already locked" rather than failing.
        #[arg(long)]
        no_strict_lock: bool,
        /// Present but inert: no live WAL/ptrack provider exists in this core (§1 non-goal).
        #[arg(long)]
        no_validate: bool,
    },
    /// Restore a backup (and its parent chain) into a destination directory.
    Restore {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        backup_id: String,
        #[arg(long)]
        restore_dir: PathBuf,
        /// §4.6 incremental-restore optimisation to trust existing blocks in
        /// `restore_dir` by: `none` (default), `checksum`, or `lsn`.
        #[arg(long, default_value = "none")]
        incremental_mode: String,
    },
    /// Fold an incremental backup into its parent.
    Merge {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        backup_id: String,
        #[arg(long)]
        no_strict_lock: bool,
    },
    /// Verify a backup's chain: manifest CRC, header-map CRCs, non-datafile CRCs,
    /// and every stored page's own checksum.
    Validate {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        backup_id: String,
        #[arg(long)]
        no_strict_lock: bool,
    },
    /// Remove a single backup from the catalog.
    Delete {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        backup_id: String,
        #[arg(long)]
        no_strict_lock: bool,
    },
    /// List instances, or one instance's backups, or (with `--timelines`) its WAL timeline tree.
    Show {
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        timelines: bool,
    },
    /// Update a backup's note / TTL / explicit expiration.
    SetBackup {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        backup_id: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long)]
        expire_time: Option<u64>,
    },
    /// Overlay one or more config keys onto an instance's config file.
    SetConfig {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        compress_algorithm: Option<String>,
        #[arg(long)]
        compress_level: Option<i32>,
        #[arg(long)]
        wal_depth: Option<u32>,
        #[arg(long)]
        retention_redundancy: Option<u32>,
        #[arg(long)]
        retention_window: Option<u32>,
    },
    /// Print an instance's resolved configuration.
    ShowConfig {
        #[arg(long)]
        instance: String,
    },
}

fn default_catalog_root() -> PathBuf {
    std::env::var("PBACKUP_CATALOG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("pbackup-catalog"))
}

fn parse_backup_mode(s: &str) -> Result<BackupMode> {
    BackupMode::parse(s).ok_or_else(|| BackupError::Config(format!("unknown backup mode {s:?}")))
}

fn parse_compress_algorithm(s: &str) -> Result<CompressAlgorithm> {
    CompressAlgorithm::parse(s).ok_or_else(|| BackupError::Config(format!("unknown compression algorithm {s:?}")))
}

fn parse_backup_id(s: &str) -> Result<BackupId> {
    s.parse().map_err(|_| BackupError::Config(format!("invalid backup id {s:?}")))
}

fn parse_incremental_mode(s: &str) -> Result<IncrementalRestoreMode> {
    match s {
        "none" => Ok(IncrementalRestoreMode::None),
        "checksum" => Ok(IncrementalRestoreMode::Checksum),
        "lsn" => Ok(IncrementalRestoreMode::Lsn),
        other => Err(BackupError::Config(format!("unknown incremental restore mode {other:?}"))),
    }
}

fn run(cli: Cli) -> Result<()> {
    let catalog_root = cli.catalog.clone().unwrap_or_else(default_catalog_root);

    match cli.command {
        Commands::Init => {
            let _ = pbackup::logger::init_console_only();
            pipeline::run_init(&catalog_root)?;
            println!("catalog initialized at {}", catalog_root.display());
        }
        Commands::AddInstance { instance, pgdata } => {
            let _ = pbackup::logger::init_console_only();
            pipeline::run_add_instance(&catalog_root, &instance, pgdata.as_deref())?;
            println!("instance {instance} added");
        }
        Commands::DelInstance { instance } => {
            let _ = pbackup::logger::init_console_only();
            pipeline::run_del_instance(&catalog_root, &instance)?;
            println!("instance {instance} removed");
        }
        Commands::Backup { instance, pgdata, backup_mode, compress_algorithm, compress_level, note, no_strict_lock, no_validate: _ } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let cli_overrides = CliOverrides { compress_alg: compress_algorithm, compress_level, ..Default::default() };
            let resolved = pbackup::config::ResolvedConfig::from(&pbackup::config::load_instance_config(&catalog_root, &instance, &cli_overrides)?);
            let req = BackupRequest {
                instance: &instance,
                pgdata: &pgdata,
                mode: parse_backup_mode(&backup_mode)?,
                compress_algorithm: resolved.compress_algorithm,
                compress_level: resolved.compress_level,
                note,
                strict: !no_strict_lock,
            };
            let id = pipeline::run_backup(&catalog_root, &req)?;
            log::info!("backup {id} of instance {instance} completed");
            println!("{id}");
        }
        Commands::Restore { instance, backup_id, restore_dir, incremental_mode } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let id = parse_backup_id(&backup_id)?;
            let mode = parse_incremental_mode(&incremental_mode)?;
            pipeline::run_restore(&catalog_root, &instance, id, &restore_dir, mode)?;
            println!("restored backup {id} of instance {instance} into {}", restore_dir.display());
        }
        Commands::Merge { instance, backup_id, no_strict_lock } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let id = parse_backup_id(&backup_id)?;
            pipeline::run_merge(&catalog_root, &instance, id, !no_strict_lock)?;
            println!("merged backup {id} into its parent");
        }
        Commands::Validate { instance, backup_id, no_strict_lock } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let id = parse_backup_id(&backup_id)?;
            pipeline::run_validate(&catalog_root, &instance, id, !no_strict_lock)?;
            println!("backup {id} is valid");
        }
        Commands::Delete { instance, backup_id, no_strict_lock } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let id = parse_backup_id(&backup_id)?;
            pipeline::run_delete(&catalog_root, &instance, id, !no_strict_lock)?;
            println!("deleted backup {id}");
        }
        Commands::Show { instance, timelines } => {
            let _ = pbackup::logger::init_console_only();
            show(&catalog_root, instance.as_deref(), timelines, cli.json, cli.plain)?;
        }
        Commands::SetBackup { instance, backup_id, note, ttl, expire_time } => {
            let _ = pbackup::logger::init_for_instance(&catalog_root, &instance);
            let id = parse_backup_id(&backup_id)?;
            let fields = SetBackupFields { note, ttl_secs: ttl, expire_time };
            pipeline::run_set_backup(&catalog_root, &instance, id, &fields, true)?;
            println!("updated backup {id}");
        }
        Commands::SetConfig { instance, compress_algorithm, compress_level, wal_depth, retention_redundancy, retention_window } => {
            let _ = pbackup::logger::init_console_only();
            if let Some(alg) = &compress_algorithm {
                parse_compress_algorithm(alg)?;
            }
            let updates = pbackup::config::InstanceConfig {
                compress_alg: compress_algorithm,
                compress_level,
                wal_depth,
                retention_redundancy,
                retention_window,
                ..Default::default()
            };
            pbackup::config::set_instance_config(&catalog_root, &instance, updates)?;
            println!("instance {instance} config updated");
        }
        Commands::ShowConfig { instance } => {
            let _ = pbackup::logger::init_console_only();
            let cfg = pbackup::config::load_instance_config(&catalog_root, &instance, &CliOverrides::default())?;
            let resolved = pbackup::config::ResolvedConfig::from(&cfg);
            if cli.json {
                let rendered = serde_json::json!({
                    "pgdata": cfg.pgdata,
                    "compress-alg": resolved.compress_algorithm.as_str(),
                    "compress-level": resolved.compress_level,
                    "wal-depth": resolved.wal_depth,
                    "retention-redundancy": resolved.retention_redundancy,
                    "retention-window": resolved.retention_window,
                });
                println!("{}", serde_json::to_string_pretty(&rendered)?);
            } else {
                println!("pgdata = {}", cfg.pgdata.as_ref().map_or_else(|| "-".to_string(), |p| p.display().to_string()));
                println!("compress-alg = {}", resolved.compress_algorithm.as_str());
                println!("compress-level = {}", resolved.compress_level);
                println!("wal-depth = {}", resolved.wal_depth);
                println!("retention-redundancy = {}", resolved.retention_redundancy);
                println!("retention-window = {}", resolved.retention_window);
            }
        }
    }
    Ok(())
}

fn show(catalog_root: &std::path::Path, instance: Option<&str>, timelines: bool, json: bool, plain: bool) -> Result<()> {
    use pbackup::catalog::instance as cat_instance;

    let Some(instance) = instance else {
        let names = cat_instance::list_instances(catalog_root)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&names)?);
        } else {
            for name in names {
                println!("{name}");
            }
        }
        return Ok(());
    };

    if timelines {
        return show_timelines(catalog_root, instance, json);
    }

    let backups = cat_instance::list_backups(catalog_root, instance)?;
    if json {
        #[derive(serde::Serialize)]
        struct Row {
            id: String,
            mode: &'static str,
            status: &'static str,
            parent: Option<String>,
            start_lsn: String,
            stop_lsn: String,
        }
        let rows: Vec<Row> = backups
            .iter()
            .map(|b| Row {
                id: b.id.to_string(),
                mode: b.mode.as_str(),
                status: b.status.as_str(),
                parent: b.parent_backup.map(|p| p.to_string()),
                start_lsn: b.start_lsn.to_string(),
                stop_lsn: b.stop_lsn.to_string(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if plain {
        for b in &backups {
            println!("{} {} {}", b.id, b.mode.as_str(), b.status.as_str());
        }
    } else {
        println!("{:<14} {:<8} {:<10} {:<14} {:<12} {:<12}", "ID", "MODE", "STATUS", "PARENT", "START LSN", "STOP LSN");
        for b in &backups {
            println!(
                "{:<14} {:<8} {:<10} {:<14} {:<12} {:<12}",
                b.id.to_string(),
                b.mode.as_str(),
                b.status.as_str(),
                b.parent_backup.map_or_else(|| "-".to_string(), |p| p.to_string()),
                b.start_lsn.to_string(),
                b.stop_lsn.to_string(),
            );
        }
    }
    Ok(())
}

/// Build the timeline forest straight off the on-disk WAL archive directory
/// (§4.8) and print each timeline's segment range, lost segments and
/// retention anchor.
fn show_timelines(catalog_root: &std::path::Path, instance: &str, json: bool) -> Result<()> {
    use std::collections::HashMap;

    use pbackup::catalog::instance as cat_instance;
    use pbackup::catalog::paths;
    use pbackup::timeline::{self, WalArchiveEntry};

    let wal_dir = paths::wal_dir(catalog_root, instance);
    let mut names = Vec::new();
    let mut sizes = HashMap::new();
    if wal_dir.exists() {
        for entry in std::fs::read_dir(&wal_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let name = name.to_string();
                let size = entry.metadata()?.len();
                sizes.insert(name.clone(), size);
                names.push(name);
            }
        }
    }

    let mut histories = HashMap::new();
    for name in &names {
        if let Some(timeline::ParsedWalFile::History { tli }) = timeline::parse_wal_filename(name) {
            histories.insert(tli, std::fs::read_to_string(wal_dir.join(name))?);
        }
    }

    let entries: Vec<WalArchiveEntry<'_>> =
        names.iter().map(|name| WalArchiveEntry { name, size: *sizes.get(name).unwrap_or(&0) }).collect();

    let backups = cat_instance::list_backups(catalog_root, instance)?;
    let mut forest = timeline::build_forest(&entries, &histories, &backups);
    let cfg = pbackup::config::load_instance_config(catalog_root, instance, &CliOverrides::default())?;
    let wal_depth = pbackup::config::ResolvedConfig::from(&cfg).wal_depth;
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let _anchors = timeline::compute_retention(&mut forest, &backups, wal_depth, now);

    if json {
        #[derive(serde::Serialize)]
        struct Row {
            tli: u32,
            parent_tli: u32,
            begin_segno: u64,
            end_segno: u64,
            n_backups: usize,
            lost_segments: usize,
            anchor_tli: u32,
        }
        let rows: Vec<Row> = forest
            .iter()
            .map(|t| Row {
                tli: t.tli,
                parent_tli: t.parent_tli,
                begin_segno: t.begin_segno,
                end_segno: t.end_segno,
                n_backups: t.backups.len(),
                lost_segments: t.lost_segments.len(),
                anchor_tli: t.anchor_tli,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("{:<6} {:<10} {:<12} {:<12} {:<9} {:<6}", "TLI", "PARENT", "BEGIN", "END", "BACKUPS", "LOST");
        for t in forest.iter() {
            println!("{:<6} {:<10} {:<12} {:<12} {:<9} {:<6}", t.tli, t.parent_tli, t.begin_segno, t.end_segno, t.backups.len(), t.lost_segments.len());
        }
    }
    Ok(())
}

/// Install the `Ctrl-C`/`SIGTERM` handler that flips the library's
/// process-wide cancellation flag (§5, §9: the library only reads this flag
/// in its retry/sleep loops; only the binary ever sets it).
fn install_interrupt_handler() {
    let _ = ctrlc::set_handler(|| {
        pbackup::lock::INTERRUPTED.store(true, std::sync::atomic::Ordering::SeqCst);
    });
}

fn main() {
    install_interrupt_handler();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}
