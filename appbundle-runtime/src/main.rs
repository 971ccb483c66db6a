//! appbundle-runtime - the ELF head of every AppBundle
//!
//! On invocation: discover the bundle's own layout, provision FUSE helpers
//! if missing, mount or extract the embedded image, run AppRun, and hand
//! teardown to a detached cleanup child.

mod cleanup;
mod config;
mod error;
mod exec;
mod flags;
mod mount;
mod provision;

use std::{
    env,
    fs,
    path::{Path, PathBuf},
    process::exit,
    thread,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use colored::Colorize;
use log::debug;
use pbundle_meta::{cache, AppBundleId};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use walkdir::WalkDir;

use crate::{
    cleanup::TeardownPlan,
    config::RuntimeConfig,
    error::{Error, Result},
    flags::Invocation,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let invocation = flags::parse(argv);

    // The cleanup child must run even on a bundle whose metadata no longer
    // parses, so it bypasses discovery entirely.
    if let Invocation::InternalCleanup {
        mount_dir,
        pool_dir,
        work_dir,
        do_not_unmount,
    } = &invocation
    {
        exit(cleanup::run_internal(
            mount_dir,
            pool_dir,
            work_dir,
            *do_not_unmount,
        ));
    }

    // Bad bundles die here, before any pool directory exists.
    let cfg = match RuntimeConfig::discover() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Error".bright_red(), e);
            exit(1);
        }
    };

    // Cleanup is suppressed for deterministic workdirs and for
    // --pbundle_mount, whose whole point is a mount that outlives us.
    let mut plan = TeardownPlan::from(&cfg);
    plan.enabled = plan.enabled && !matches!(invocation, Invocation::Mount { .. });

    install_signal_handler(plan.clone());

    match dispatch(&cfg, &plan, invocation) {
        Ok(code) => exit(code),
        Err(e) => fail(&plan, e),
    }
}

fn fail(plan: &TeardownPlan, e: Error) -> ! {
    eprintln!("{}: {}", "Error".bright_red(), e);
    teardown(plan);
    exit(1)
}

fn teardown(plan: &TeardownPlan) {
    if plan.enabled {
        cleanup::spawn_detached(plan, false);
    }
}

/// SIGINT/SIGTERM are an orderly shutdown: spawn the detached cleanup child
/// and leave with status 0.
fn install_signal_handler(plan: TeardownPlan) {
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            thread::spawn(move || {
                if signals.forever().next().is_some() {
                    teardown(&plan);
                    exit(0);
                }
            });
        }
        Err(e) => debug!("could not install signal handler: {}", e),
    }
}

fn dispatch(cfg: &RuntimeConfig, plan: &TeardownPlan, invocation: Invocation) -> Result<i32> {
    match invocation {
        Invocation::Help => {
            print_help(cfg);
            Ok(0)
        }
        Invocation::Offset => {
            println!("{}", cfg.archive_offset);
            Ok(0)
        }
        Invocation::PortableHome => create_portable_dir(cfg, "home"),
        Invocation::PortableConfig => create_portable_dir(cfg, "config"),
        Invocation::List => {
            mount::provide(cfg, &[])?;
            for entry in WalkDir::new(&cfg.mount_dir)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                println!("{}", entry.path().display());
            }
            teardown(plan);
            Ok(0)
        }
        Invocation::PngIcon => dump_base64(cfg, plan, &cfg.mount_dir.join(".DirIcon")),
        Invocation::SvgIcon => dump_base64(cfg, plan, &cfg.mount_dir.join(".DirIcon.svg")),
        Invocation::Desktop => dump_first_with_ext(cfg, plan, "desktop"),
        Invocation::Appstream => dump_first_with_ext(cfg, plan, "xml"),
        Invocation::Extract { globs } => {
            let dest = env::current_dir()?.join(format!("{}_{}", cfg.r_exe_name, cfg.fs_type));
            fs::create_dir_all(&dest)?;
            mount::extract(cfg, &dest, &globs)?;
            println!("{}", dest.display());
            Ok(0)
        }
        Invocation::ExtractAndRun { args } => {
            fs::create_dir_all(&cfg.mount_dir)?;
            mount::extract(cfg, &cfg.mount_dir, &[])?;
            let code = exec::run_entrypoint(cfg, &cfg.entrypoint, &args)?;
            teardown(plan);
            Ok(code)
        }
        Invocation::Mount { dir } => {
            // Same strategy dispatch as a normal run, against the custom
            // target when one was given.
            let target = match dir {
                Some(dir) => {
                    mount::provide_at(cfg, &dir, &[])?;
                    dir
                }
                None => {
                    mount::provide(cfg, &[])?;
                    cfg.mount_dir.clone()
                }
            };
            println!("{}", target.display());
            // Idle until signalled. The plan is disabled for this mode, so
            // the mount survives until --pbundle_cleanup or a manual unmount.
            loop {
                thread::park();
            }
        }
        Invocation::Cleanup => {
            cleanup::force_cleanup(cfg);
            cache::remove(&cfg.self_path);
            Ok(0)
        }
        Invocation::Link { target, args } => {
            mount::provide(cfg, &[])?;
            let entry = exec::resolve_entry(cfg, Some(&target));
            let code = exec::run_entrypoint(cfg, &entry, &args)?;
            teardown(plan);
            Ok(code)
        }
        Invocation::Run { args } => {
            mount::provide(cfg, &[])?;
            let code = exec::run_entrypoint(cfg, &cfg.entrypoint, &args)?;
            teardown(plan);
            Ok(code)
        }
        // Handled in main before discovery
        Invocation::InternalCleanup { .. } => Ok(0),
    }
}

fn print_help(cfg: &RuntimeConfig) {
    let pretty = AppBundleId::parse(&cfg.app_bundle_id)
        .map(|id| id.to_string())
        .unwrap_or_else(|_| cfg.app_bundle_id.clone());
    println!(
        "{} (pelf {}, built on {})",
        pretty.bright_cyan().bold(),
        cfg.pelf_version,
        cfg.host_info
    );
    println!(
        "{} image, {} bytes at offset {}",
        cfg.fs_type, cfg.image_size, cfg.archive_offset
    );
    println!();
    print!("{}", flags::HELP_TEXT);
}

fn create_portable_dir(cfg: &RuntimeConfig, kind: &str) -> Result<i32> {
    let dir = exec::portable_dir(&cfg.self_path, kind);
    fs::create_dir_all(&dir)?;
    println!("{}", dir.display());
    Ok(0)
}

fn dump_base64(cfg: &RuntimeConfig, plan: &TeardownPlan, path: &Path) -> Result<i32> {
    mount::provide(cfg, &[])?;
    let bytes = fs::read(path).map_err(|_| {
        Error::Other(format!(
            "{} is not present in this bundle",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        ))
    })?;
    println!("{}", BASE64.encode(bytes));
    teardown(plan);
    Ok(0)
}

/// Base64-dump the first top-level file with the given extension.
fn dump_first_with_ext(cfg: &RuntimeConfig, plan: &TeardownPlan, ext: &str) -> Result<i32> {
    mount::provide(cfg, &[])?;

    let mut candidates: Vec<PathBuf> = fs::read_dir(&cfg.mount_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect();
    candidates.sort();

    let Some(found) = candidates.first() else {
        // fail() tears down after this propagates
        return Err(Error::Other(format!(
            "no top-level .{} file in this bundle",
            ext
        )));
    };
    let bytes = fs::read(found)?;
    println!("{}", BASE64.encode(bytes));
    teardown(plan);
    Ok(0)
}
