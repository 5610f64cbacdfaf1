use thiserror::Error;

use crate::patcher::LoadState;
use crate::version::KernelVersion;

/// Reported by a `KernelPatcher` when it refuses to redirect a function.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("address {0:#x} is not inside any loaded image")]
    OutOfImage(usize),
    #[error("address {0:#x} is already routed")]
    AlreadyRouted(usize),
    #[error("code region at {0:#x} is not patchable: {1}")]
    NotPatchable(usize, String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("symbol {0} not found")]
    SymbolUnresolved(String),
    #[error("failed to route {symbol}: {source}")]
    InstallFailed {
        symbol: String,
        #[source]
        source: RouteError,
    },
    #[error("{0} is already routed")]
    AlreadyInstalled(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadStateError {
    #[error("cannot move {id} from {from:?} to {to:?}")]
    Backwards {
        id: &'static str,
        from: LoadState,
        to: LoadState,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("all patches disabled by boot argument")]
    Disabled,
    #[error("kernel version {0} is not supported")]
    UnsupportedVersion(KernelVersion),
    #[error("selector already registered")]
    AlreadyRegistered,
    #[error("selector not registered yet")]
    NotRegistered,
    #[error("kernel hook already processed")]
    KernelHookDone,
    #[error("no watched module matches load index {0}")]
    UnknownModule(usize),
}
