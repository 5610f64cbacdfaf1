//! Policy tables: which kexts to watch and what to do on each OS era.

use std::fmt;
use std::sync::OnceLock;

use crate::error::SelectorError;
use crate::hooks::{self, PagePolicy};
use crate::patcher::KextInfo;
use crate::patches::{self, PatchDescriptor, AMD_RADEON_X4000_HWLIBS_ID, AMD_RADEON_X4000_ID};
use crate::route::Intercept;
use crate::version::{KernelVersion, VersionRange};

pub const BOOT_ARG_OFF: &str = "-polaris22off";
pub const BOOT_ARG_DEBUG: &str = "-polaris22dbg";
pub const BOOT_ARG_BETA: &str = "-polaris22beta";

pub const AMD_RADEON_X4000: usize = 0;
pub const AMD_RADEON_X4000_HWLIBS: usize = 1;

static AMD_RADEON_X4000_PATHS: [&str; 1] =
    ["/System/Library/Extensions/AMDRadeonX4000.kext/Contents/MacOS/AMDRadeonX4000"];
static AMD_RADEON_X4000_HWLIBS_PATHS: [&str; 1] = [
    "/System/Library/Extensions/AMDRadeonX4000HWServices.kext/Contents/PlugIns/AMDRadeonX4000HWLibs.kext/Contents/MacOS/AMDRadeonX4000HWLibs",
];

const DYLD_DIR: &str = "/System/Library/dyld/";
const CRYPTEX_DYLD_DIR: &str = "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld/";

/// How far past a resolved entry point a function body patch may match.
const FUNCTION_BODY_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootFlags {
    pub disable_all: bool,
    pub debug: bool,
    pub beta: bool,
}

impl BootFlags {
    pub fn from_boot_args(args: &str) -> Self {
        let mut flags = BootFlags::default();
        for arg in args.split_whitespace() {
            match arg {
                BOOT_ARG_OFF => flags.disable_all = true,
                BOOT_ARG_DEBUG => flags.debug = true,
                BOOT_ARG_BETA => flags.beta = true,
                _ => {}
            }
        }
        flags
    }
}

#[derive(Clone, Copy)]
pub enum Action {
    Route(&'static dyn Intercept),
    /// Byte patch over the whole image of the module that loaded.
    Lookup(&'static PatchDescriptor),
    /// Byte patch confined to the body of a resolved function.
    FunctionBody {
        symbol: &'static str,
        descriptor: &'static PatchDescriptor,
        window: usize,
    },
}

impl Action {
    pub fn is_route(&self) -> bool {
        matches!(self, Action::Route(_))
    }

    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Action::Route(binding) => Some(binding.symbol()),
            Action::FunctionBody { symbol, .. } => Some(*symbol),
            Action::Lookup(_) => None,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Route(binding) => f.debug_tuple("Route").field(&binding.symbol()).finish(),
            Action::Lookup(descriptor) => f.debug_tuple("Lookup").field(&descriptor.name).finish(),
            Action::FunctionBody { symbol, descriptor, window } => f
                .debug_struct("FunctionBody")
                .field("symbol", symbol)
                .field("descriptor", &descriptor.name)
                .field("window", window)
                .finish(),
        }
    }
}

/// The shared cache patch applied through page validation.
#[derive(Debug, Clone, Copy)]
pub struct SharedCachePatch {
    pub descriptor: &'static PatchDescriptor,
    pub cache_dir: &'static str,
}

#[derive(Debug, Clone)]
pub struct EraPolicy {
    pub name: &'static str,
    pub range: VersionRange,
    pub shared_cache: SharedCachePatch,
    /// Actions keyed by position in [`FixupConfig::kexts`].
    pub modules: Vec<(usize, Vec<Action>)>,
}

impl EraPolicy {
    pub fn actions_for(&self, kext: usize) -> &[Action] {
        self.modules
            .iter()
            .find(|(index, _)| *index == kext)
            .map(|(_, actions)| actions.as_slice())
            .unwrap_or(&[])
    }
}

pub struct FixupConfig {
    pub kexts: Vec<KextInfo>,
    pub kernel_routes: Vec<&'static dyn Intercept>,
    pub page_policy: &'static OnceLock<PagePolicy>,
    /// Versions accepted without the beta flag.
    pub supported: VersionRange,
    /// Ordered oldest first.
    pub eras: Vec<EraPolicy>,
    pub flags: BootFlags,
}

impl FixupConfig {
    /// The shipped configuration.
    pub fn polaris22(flags: BootFlags) -> Self {
        let route_era = |name: &'static str,
                         range: VersionRange,
                         descriptor: &'static PatchDescriptor,
                         cache_dir: &'static str| EraPolicy {
            name,
            range,
            shared_cache: SharedCachePatch {
                descriptor,
                cache_dir,
            },
            modules: vec![
                (
                    AMD_RADEON_X4000,
                    vec![
                        Action::Route(&hooks::GET_HARDWARE_INFO),
                        Action::Route(&hooks::FIRMWARE_LOAD_GATE),
                    ],
                ),
                (
                    AMD_RADEON_X4000_HWLIBS,
                    vec![Action::Lookup(&patches::CAIL_DDI_CAPS_POLARIS22_A0)],
                ),
            ],
        };

        FixupConfig {
            kexts: vec![
                KextInfo::new(AMD_RADEON_X4000_ID, &AMD_RADEON_X4000_PATHS),
                KextInfo::new(AMD_RADEON_X4000_HWLIBS_ID, &AMD_RADEON_X4000_HWLIBS_PATHS),
            ],
            kernel_routes: vec![&hooks::CS_VALIDATE_PAGE as &'static dyn Intercept],
            page_policy: &hooks::PAGE_POLICY,
            supported: VersionRange::new(KernelVersion::BIG_SUR, KernelVersion::SONOMA),
            eras: vec![
                route_era(
                    "Big Sur - Monterey",
                    VersionRange::new(KernelVersion::BIG_SUR, KernelVersion::MONTEREY),
                    &patches::ARRAY_MODE_MONTEREY,
                    DYLD_DIR,
                ),
                route_era(
                    "Ventura - Sonoma",
                    VersionRange::new(KernelVersion::VENTURA, KernelVersion::SONOMA),
                    &patches::ARRAY_MODE_MONTEREY,
                    CRYPTEX_DYLD_DIR,
                ),
                EraPolicy {
                    name: "Sequoia",
                    range: VersionRange::new(KernelVersion::SEQUOIA, KernelVersion::SEQUOIA),
                    shared_cache: SharedCachePatch {
                        descriptor: &patches::ARRAY_MODE_SEQUOIA,
                        cache_dir: CRYPTEX_DYLD_DIR,
                    },
                    modules: vec![(
                        AMD_RADEON_X4000,
                        vec![
                            Action::Route(&hooks::GET_HARDWARE_INFO),
                            Action::FunctionBody {
                                symbol: hooks::FIRMWARE_LOAD_GATE_SYMBOL,
                                descriptor: &patches::FIRMWARE_LOAD_GATE_BODY,
                                window: FUNCTION_BODY_WINDOW,
                            },
                        ],
                    )],
                },
            ],
            flags,
        }
    }

    /// Picks the era policy for `version`, honouring the boot flags.
    pub fn era_for(&self, version: KernelVersion) -> Result<usize, SelectorError> {
        if self.flags.disable_all {
            return Err(SelectorError::Disabled);
        }
        if version < self.supported.min {
            return Err(SelectorError::UnsupportedVersion(version));
        }
        if version > self.supported.max && !self.flags.beta {
            return Err(SelectorError::UnsupportedVersion(version));
        }

        if let Some(era) = self.eras.iter().position(|era| era.range.contains(version)) {
            return Ok(era);
        }

        // Beta on a release newer than every era: assume the newest layout.
        match self.eras.last() {
            Some(newest) if self.flags.beta && version > newest.range.max => Ok(self.eras.len() - 1),
            _ => Err(SelectorError::UnsupportedVersion(version)),
        }
    }
}
