use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::*;

use polaris22_fixup::host::{self, UserlandPatcher};
use polaris22_fixup::config::BOOT_ARG_OFF;
use polaris22_fixup::{BootFlags, KernelVersion, Outcome, SelectorError};

/// Applies the Polaris 22 fixups to driver images and a shared cache on disk.
#[derive(Debug, Parser)]
#[command(name = "polaris22-fixup", version)]
struct Cli {
    /// Darwin major version to patch for (default: the running kernel)
    #[arg(long)]
    darwin: Option<u32>,
    /// Boot arguments, e.g. "-polaris22dbg -polaris22beta"
    #[arg(long, env = "POLARIS22_BOOT_ARGS", default_value = "")]
    boot_args: String,
    /// dyld shared cache file fed through page validation
    #[arg(long)]
    shared_cache: Option<PathBuf>,
    /// Path the shared cache pages are validated as (default: --shared-cache)
    #[arg(long, requires = "shared_cache")]
    cache_path: Option<String>,
    /// Directory receiving the patched images
    #[arg(long)]
    out: Option<PathBuf>,
    /// Driver images as BUNDLE_ID=PATH
    #[arg(value_parser = parse_kext)]
    kexts: Vec<(String, PathBuf)>,
}

fn parse_kext(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => Ok((id.to_string(), path.into())),
        _ => Err(format!("expected BUNDLE_ID=PATH, got {:?}", arg)),
    }
}

fn report(what: &str, outcomes: &[Outcome]) {
    for outcome in outcomes {
        match outcome {
            Outcome::Routed { symbol, original } => {
                info!("{}: routed {} (original at {:#x})", what, symbol, original)
            }
            Outcome::Patched { name, offsets } => {
                for offset in offsets {
                    info!("{}: patched {} at offset {:#x}", what, name, offset)
                }
            }
            Outcome::NotFound { name } => warn!("{}: {} not found", what, name),
            Outcome::Failed { action, reason } => error!("{}: {} failed: {}", what, action, reason),
        }
    }
}

fn write_out(dir: &Path, image: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let name = image
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", image.display()))?;
    let target = dir.join(name);
    std::fs::write(&target, bytes).with_context(|| format!("writing {}", target.display()))?;
    info!("Wrote {}", target.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let flags = BootFlags::from_boot_args(&args.boot_args);
    polaris22_fixup::init_logging(flags);

    let version = match args.darwin {
        Some(major) => KernelVersion(major),
        None => host::current_kernel_version()
            .ok_or_else(|| anyhow!("not running on Darwin, pass --darwin N"))?,
    };

    let (mut selector, watched) = match polaris22_fixup::plugin_start(flags, version) {
        Ok(started) => started,
        Err(SelectorError::Disabled) => {
            info!("All patches disabled by {}", BOOT_ARG_OFF);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let mut patcher = UserlandPatcher::new();

    let outcomes = selector.on_kernel_hook(&mut patcher)?;
    report("kernel", &outcomes);

    if let Some(dir) = &args.out {
        std::fs::create_dir_all(dir)?;
    }

    for (id, path) in &args.kexts {
        let Some(kext) = selector.kexts().iter().position(|info| info.id == id.as_str()) else {
            warn!("{} is not a driver this fixup knows", id);
            continue;
        };
        if !watched.contains(&kext) {
            info!("{} has nothing to patch on {}", id, version);
            continue;
        }

        let outcomes = host::load_kext(&mut selector, &mut patcher, kext, path)?;
        report(id, &outcomes);

        if let (Some(dir), Some(image)) = (&args.out, patcher.images().last()) {
            write_out(dir, &image.path, image.bytes())?;
        }
    }

    if let Some(cache) = &args.shared_cache {
        let mut bytes = std::fs::read(cache).with_context(|| format!("reading {}", cache.display()))?;
        let vnode_path = match &args.cache_path {
            Some(path) => path.clone(),
            None => cache.to_string_lossy().into_owned(),
        };
        let changed = patcher.validate_pages(&vnode_path, &mut bytes)?;
        info!("{}: {} page(s) patched", vnode_path, changed);

        if let Some(dir) = &args.out {
            write_out(dir, cache, &bytes)?;
        }
    }

    Ok(())
}
