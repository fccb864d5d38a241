use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dicom_dedup::config::{Config, ConfigBuilder};
use dicom_dedup::study::RejectOutcome;
use dicom_dedup::{Archive, ArchiveError, ExtractedInstance};
use env_logger::Builder;
use log::{info, warn, Level, LevelFilter};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Maintain a deduplicated DICOM study archive
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Archive root directory
    #[arg(short = 'd', long, value_name = "ROOT_DIR", env = "DCMDEDUP_ROOT", global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, value_name = "CONFIG_FILE", global = true)]
    config: Option<PathBuf>,

    /// Show more verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import DICOM files into the archive
    Import(ImportArgs),

    /// Mark instances or series as deleted
    Reject {
        /// Paths like 'studies/<study>/series/<series>[/instances/<sop>]'
        #[arg(required = true)]
        paths: Vec<String>,

        /// Reason recorded in the log
        #[arg(long, default_value = "rejected")]
        reason: String,
    },

    /// Remove studies from the archive
    Delete {
        /// Study Instance UIDs
        #[arg(required = true)]
        studies: Vec<String>,
    },

    /// Rebuild the studies catalogue
    Reindex,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Input files or directories
    #[arg(required = true, value_name = "INPUT_PATH")]
    inputs: Vec<PathBuf>,

    /// Recursively look for files in input directories
    #[arg(short, long)]
    recursive: bool,

    /// Continue when a file found is not DICOM
    #[arg(short, long = "continue")]
    r#continue: bool,

    /// Write a deduplicated snapshot per instance
    #[arg(long)]
    instance_snapshots: bool,

    /// Write the full metadata of every instance
    #[arg(long)]
    instance_metadata: bool,

    /// Prefix for bulk data URIs
    #[arg(long, value_name = "PREFIX")]
    bulk_data_uri_prefix: Option<String>,
}

fn init_logging(verbose: bool) {
    let log_level = if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    let mut builder = Builder::from_default_env();
    builder
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "Error",
                Level::Warn => "Warning",
                Level::Info => "Info",
                Level::Debug => "Debug",
                Level::Trace => "Trace",
            };
            writeln!(buf, "{}: {}", level, record.args())
        })
        .filter(None, log_level);
    builder.init();
}

fn config_builder(cli: &Cli) -> Result<ConfigBuilder> {
    let mut builder = match &cli.config {
        Some(path) => ConfigBuilder::from_config(
            Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))?,
        ),
        None => ConfigBuilder::new(),
    };
    if let Some(root) = &cli.root {
        builder = builder.root_dir(root);
    }
    Ok(builder)
}

fn input_files(inputs: &[PathBuf], recurse: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            let mut walk_dir = WalkDir::new(input).sort_by_file_name();
            if !recurse {
                walk_dir = walk_dir.max_depth(1);
            }
            files.extend(
                walk_dir
                    .into_iter()
                    .filter_map(Result::ok)
                    .map(|entry| entry.into_path())
                    .filter(|path| path.is_file()),
            );
        } else {
            bail!("{} is neither a file nor a directory", input.display());
        }
    }
    Ok(files)
}

fn extract(archive: &Archive, path: &Path) -> Result<ExtractedInstance> {
    archive
        .extract_file(path)
        .with_context(|| format!("failed to extract {}", path.display()))
}

fn import(archive: &mut Archive, args: &ImportArgs) -> Result<()> {
    let files = input_files(&args.inputs, args.recursive)?;
    info!("extracting {} files", files.len());

    let shared: &Archive = archive;
    let extracted = files
        .par_iter()
        .map(|path| match extract(shared, path) {
            Ok(instance) => Ok(Some(instance)),
            Err(e) => match e.downcast_ref::<ArchiveError>() {
                Some(ArchiveError::CannotImport(_)) => {
                    warn!("{:#}", e);
                    Ok(None)
                }
                Some(ArchiveError::ReadError(_)) if args.r#continue => {
                    warn!("{:#}", e);
                    Ok(None)
                }
                _ => Err(e),
            },
        })
        .collect::<Result<Vec<_>>>()?;

    let mut instances: Vec<ExtractedInstance> = extracted.into_iter().flatten().collect();
    instances.sort_by(|a, b| a.study_instance_uid.cmp(&b.study_instance_uid));

    let mut added = 0;
    let total = instances.len();
    for instance in instances {
        if archive.ingest(instance)? {
            added += 1;
        }
    }
    archive.finish()?;
    info!("imported {total} instances, {added} new or changed");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut builder = config_builder(&cli)?;
    if let Command::Import(args) = &cli.command {
        if args.instance_snapshots {
            builder = builder.write_instance_snapshots(true);
        }
        if args.instance_metadata {
            builder = builder.write_instance_metadata(true);
        }
        if let Some(prefix) = &args.bulk_data_uri_prefix {
            builder = builder.bulk_data_uri_prefix(prefix.as_str());
        }
    }
    let config = builder.build()?;
    let mut archive = Archive::new(config);

    match &cli.command {
        Command::Import(args) => import(&mut archive, args)?,
        Command::Reject { paths, reason } => {
            for path in paths {
                match archive.reject_path(path, reason)? {
                    RejectOutcome::Rejected(count) => info!("{path}: rejected {count} instances"),
                    RejectOutcome::NoMatch => warn!("{path}: nothing to reject"),
                }
            }
        }
        Command::Delete { studies } => {
            for study in studies {
                archive
                    .delete_study(study)
                    .with_context(|| format!("failed to delete study {study}"))?;
            }
        }
        Command::Reindex => {
            let count = archive.reindex()?;
            info!("catalogue lists {count} studies");
        }
    }
    Ok(())
}
