//! pelf CLI - AppBundle builder
//!
//! Takes an AppDir plus identity metadata and writes a single self-mounting
//! executable: runtime loader + embedded helper tools + CBOR metadata +
//! filesystem image.

use std::{fs, path::PathBuf};

use clap::{Parser, ValueEnum};
use colored::Colorize;
use pbundle_meta::{AppBundleId, FilesystemType, RuntimeInfo, DEFAULT_MOUNT_OR_EXTRACT};
use pelf::{
    archive,
    composer::{self, ComposeRequest},
    error::{Error, Result},
    static_tools, ToolSearch,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FsChoice {
    Squashfs,
    Dwarfs,
}

impl From<FsChoice> for FilesystemType {
    fn from(choice: FsChoice) -> Self {
        match choice {
            FsChoice::Squashfs => FilesystemType::Squashfs,
            FsChoice::Dwarfs => FilesystemType::Dwarfs,
        }
    }
}

/// pelf - Package an AppDir into a self-mounting AppBundle
#[derive(Parser)]
#[command(name = "pelf")]
#[command(about = "Package an AppDir into a self-mounting AppBundle", long_about = None)]
#[command(version)]
struct Cli {
    /// Source AppDir containing an AppRun entry point
    #[arg(short = 'a', long = "add-appdir", required_unless_present = "list_static_tools")]
    appdir: Option<PathBuf>,

    /// Identity string (name#repo[:version][@date] or legacy form)
    #[arg(short = 'i', long = "appbundle-id", required_unless_present = "list_static_tools")]
    appbundle_id: Option<String>,

    /// Output path; .sqfs.AppBundle / .dwfs.AppBundle suffixes pick the
    /// filesystem when --filesystem is not given
    #[arg(short = 'o', long = "output-to", required_unless_present = "list_static_tools")]
    output: Option<PathBuf>,

    /// Filesystem image format
    #[arg(short = 'j', long = "filesystem", value_enum)]
    filesystem: Option<FsChoice>,

    /// Free-form packer arguments, split on whitespace, replacing the
    /// default compression configuration
    #[arg(short = 'c', long = "compression")]
    compression: Option<String>,

    /// Omit the embedded static-tools archive
    #[arg(short = 't', long = "do-not-embed-static-tools")]
    no_static_tools: bool,

    /// Pick helper tools from this directory instead of PATH
    #[arg(long = "static-tools-dir")]
    static_tools_dir: Option<PathBuf>,

    /// Override the runtime loader executable
    #[arg(long = "runtime", env = "PELF_RUNTIME")]
    runtime: Option<PathBuf>,

    /// Compress each static tool with UPX before archiving
    #[arg(long)]
    upx: bool,

    /// Give the host PATH precedence over internal tool directories
    #[arg(long = "prefer-tools-in-path")]
    prefer_tools_in_path: bool,

    /// Print `<name> # <blake3>` for every embedded helper and exit
    #[arg(long = "list-static-tools")]
    list_static_tools: bool,

    /// Use a deterministic, reusable workdir at run time
    #[arg(short = 'd', long = "disable-use-random-workdir")]
    disable_random_workdir: bool,
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn host_info() -> String {
    nix::sys::utsname::uname()
        .map(|uts| {
            format!(
                "{} {} {}",
                uts.sysname().to_string_lossy(),
                uts.release().to_string_lossy(),
                uts.machine().to_string_lossy()
            )
        })
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Format file size in human-readable format
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

fn run(cli: Cli) -> Result<()> {
    let fs_type = cli
        .filesystem
        .map(FilesystemType::from)
        .or_else(|| cli.output.as_deref().and_then(FilesystemType::from_output_name))
        .unwrap_or(FilesystemType::Squashfs);

    let tools = ToolSearch::new()
        .with_optional_dir(cli.static_tools_dir.clone())
        .with_optional_dir(std::env::var_os("PELF_BINARY_DEPS").map(PathBuf::from))
        .prefer_path(cli.prefer_tools_in_path);

    if cli.list_static_tools {
        let resolved = static_tools::resolve(fs_type, &tools)?;
        for line in static_tools::listing(&resolved)? {
            println!("{}", line);
        }
        return Ok(());
    }

    // clap enforces these outside --list-static-tools mode
    let appdir = cli
        .appdir
        .ok_or_else(|| Error::Other("--add-appdir is required".into()))?;
    let raw_id = cli
        .appbundle_id
        .ok_or_else(|| Error::Other("--appbundle-id is required".into()))?;
    let output = cli
        .output
        .ok_or_else(|| Error::Other("--output-to is required".into()))?;

    let id = AppBundleId::parse(&raw_id)?;

    info!("Packing {} into a {} image", appdir.display(), fs_type);
    let scratch = tempfile::tempdir()?;
    let image = scratch.path().join(format!("image.{}", fs_type));
    archive::pack_appdir(&appdir, &image, fs_type, cli.compression.as_deref(), &tools)?;

    let static_tools_blob = if cli.no_static_tools {
        None
    } else {
        info!("Collecting static tools for {}", fs_type);
        let resolved = static_tools::resolve(fs_type, &tools)?;
        Some(static_tools::pack(&resolved, cli.upx, &tools)?)
    };

    let record = RuntimeInfo {
        app_bundle_id: id.to_string(),
        pelf_version: env!("CARGO_PKG_VERSION").to_string(),
        host_info: host_info(),
        filesystem_type: fs_type,
        hash: String::new(),
        disable_random_work_dir: cli.disable_random_workdir,
        mount_or_extract: DEFAULT_MOUNT_OR_EXTRACT,
    };

    let runtime = composer::resolve_runtime(cli.runtime.as_deref())?;
    info!("Composing {}", output.display());
    let record = composer::compose(
        ComposeRequest {
            runtime: &runtime,
            image: &image,
            static_tools: static_tools_blob.as_deref(),
            info: record,
            output: &output,
        },
        &tools,
    )?;

    let size = fs::metadata(&output)?.len();
    println!(
        "[{}] {} ({}, {}, {})",
        "✔".bright_green().bold(),
        output.display(),
        format_size(size),
        fs_type,
        record.hash.get(..8).unwrap_or(&record.hash)
    );
    Ok(())
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".bright_red(), e);
        std::process::exit(1);
    }
}
