//! Load-time patches that let Polaris 22 (Vega M) GPUs run on the AMD
//! Polaris driver stack of macOS releases that no longer support them.

pub mod config;
pub mod error;
pub mod hooks;
pub mod host;
pub mod patcher;
pub mod patches;
pub mod route;
pub mod scan;
pub mod selector;
pub mod version;

use log::*;

pub use config::{BootFlags, FixupConfig};
pub use error::{InstallError, RouteError, SelectorError};
pub use patcher::{KernelPatcher, ModuleRef};
pub use patches::PatchDescriptor;
pub use selector::{Outcome, Selector};
pub use version::{KernelVersion, VersionRange};

/// Installs the global logger; `-polaris22dbg` turns on debug output.
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_logging(flags: BootFlags) {
    let level = if flags.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    // Someone else may own the logger already.
    let _ = builder.try_init();
}

/// Builds the shipped configuration and registers it for `version`.
///
/// The returned selector is ready for the kernel hook and load events.
pub fn plugin_start(
    flags: BootFlags,
    version: KernelVersion,
) -> Result<(Selector, Vec<usize>), SelectorError> {
    debug!("start");
    let mut selector = Selector::new(FixupConfig::polaris22(flags));
    let watched = selector.register(version)?;
    for &kext in &watched {
        debug!("Watching {}", selector.kexts()[kext].id);
    }
    Ok((selector, watched))
}
