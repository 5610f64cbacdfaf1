use std::fmt;
use std::sync::OnceLock;

use log::*;

use crate::error::InstallError;
use crate::patcher::{KernelPatcher, ModuleRef};

/// A typed function pointer that can round-trip through a raw address.
pub trait FunctionHandle: Copy + Send + Sync + 'static {
    fn address(self) -> usize;

    /// # Safety
    ///
    /// `address` must be the entry point of a function with exactly this
    /// signature and calling convention.
    unsafe fn from_address(address: usize) -> Self;
}

macro_rules! function_handle {
    ($($arg:ident),*) => {
        impl<R: 'static, $($arg: 'static),*> FunctionHandle for unsafe extern "C" fn($($arg),*) -> R {
            fn address(self) -> usize {
                self as usize
            }

            unsafe fn from_address(address: usize) -> Self {
                std::mem::transmute_copy::<usize, Self>(&address)
            }
        }
    };
}

function_handle!();
function_handle!(A);
function_handle!(A, B);
function_handle!(A, B, C);
function_handle!(A, B, C, D);
function_handle!(A, B, C, D, E);
function_handle!(A, B, C, D, E, G);
function_handle!(A, B, C, D, E, G, H);

/// Redirect of one exported function to a replacement, plus the saved
/// original entry point.
pub struct InterceptBinding<F: FunctionHandle> {
    module: ModuleRef,
    symbol: &'static str,
    replacement: F,
    original: OnceLock<F>,
}

impl<F: FunctionHandle> InterceptBinding<F> {
    pub const fn new(module: ModuleRef, symbol: &'static str, replacement: F) -> Self {
        InterceptBinding {
            module,
            symbol,
            replacement,
            original: OnceLock::new(),
        }
    }

    pub fn replacement(&self) -> F {
        self.replacement
    }

    pub fn try_original(&self) -> Option<F> {
        self.original.get().copied()
    }

    /// The original entry point.
    ///
    /// Replacements only run because the redirect was installed, so an empty
    /// slot here is a broken invariant.
    pub fn original(&self) -> F {
        match self.original.get() {
            Some(original) => *original,
            None => panic!("{} called through before its route was installed", self.symbol),
        }
    }
}

impl<F: FunctionHandle> fmt::Debug for InterceptBinding<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptBinding")
            .field("module", &self.module)
            .field("symbol", &self.symbol)
            .field("installed", &self.original.get().is_some())
            .finish()
    }
}

/// Type-erased view of an [`InterceptBinding`] for the policy tables.
pub trait Intercept: Sync {
    fn module(&self) -> ModuleRef;
    fn symbol(&self) -> &'static str;
    fn is_installed(&self) -> bool;

    /// Resolves, routes and records the original. At most one success per binding.
    fn install(&self, patcher: &mut dyn KernelPatcher) -> Result<usize, InstallError>;
}

impl<F: FunctionHandle> Intercept for InterceptBinding<F> {
    fn module(&self) -> ModuleRef {
        self.module
    }

    fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn is_installed(&self) -> bool {
        self.original.get().is_some()
    }

    fn install(&self, patcher: &mut dyn KernelPatcher) -> Result<usize, InstallError> {
        if self.is_installed() {
            return Err(InstallError::AlreadyInstalled(self.symbol.to_string()));
        }

        let target = patcher
            .resolve_symbol(self.module, self.symbol)
            .ok_or_else(|| InstallError::SymbolUnresolved(self.symbol.to_string()))?;
        debug!("Routing {} at {:#x}", self.symbol, target);

        let original = patcher
            .route(target, self.replacement.address())
            .map_err(|source| InstallError::InstallFailed {
                symbol: self.symbol.to_string(),
                source,
            })?;

        // SAFETY: the patcher hands back an entry point for the routed target,
        // which has the signature this binding was declared with.
        let handle = unsafe { F::from_address(original) };
        if self.original.set(handle).is_err() {
            return Err(InstallError::AlreadyInstalled(self.symbol.to_string()));
        }

        debug!("Routed {}, original at {:#x}", self.symbol, original);
        Ok(original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouteError;
    use crate::patcher::mock::MockPatcher;

    type Double = unsafe extern "C" fn(i32) -> i32;

    unsafe extern "C" fn double(x: i32) -> i32 {
        x * 2
    }

    unsafe extern "C" fn triple(x: i32) -> i32 {
        x * 3
    }

    fn binding() -> InterceptBinding<Double> {
        InterceptBinding::new(ModuleRef::Kernel, "_double", triple as Double)
    }

    #[test]
    fn function_handle_round_trips() {
        let f = double as Double;
        let g = unsafe { Double::from_address(f.address()) };
        assert_eq!(unsafe { g(21) }, 42);
    }

    #[test]
    fn install_records_original_once() {
        let binding = binding();
        let mut patcher = MockPatcher::default();
        let target = 0x4000;
        patcher.symbols.insert((ModuleRef::Kernel, "_double".into()), target);
        patcher.originals.insert(target, (double as Double).address());

        assert!(binding.try_original().is_none());
        let original = binding.install(&mut patcher).unwrap();
        assert_eq!(original, (double as Double).address());
        assert_eq!(patcher.routes, vec![(target, (triple as Double).address())]);
        assert_eq!(unsafe { binding.original()(5) }, 10);

        assert_eq!(
            binding.install(&mut patcher),
            Err(InstallError::AlreadyInstalled("_double".into()))
        );
        assert_eq!(patcher.routes.len(), 1);
    }

    #[test]
    fn unresolved_symbol_leaves_slot_empty() {
        let binding = binding();
        let mut patcher = MockPatcher::default();
        assert_eq!(
            binding.install(&mut patcher),
            Err(InstallError::SymbolUnresolved("_double".into()))
        );
        assert!(!binding.is_installed());
        assert!(patcher.routes.is_empty());
    }

    #[test]
    fn rejected_route_leaves_slot_empty() {
        let binding = binding();
        let mut patcher = MockPatcher {
            reject_routes: true,
            ..Default::default()
        };
        patcher.symbols.insert((ModuleRef::Kernel, "_double".into()), 0x4000);
        let err = binding.install(&mut patcher).unwrap_err();
        assert_eq!(
            err,
            InstallError::InstallFailed {
                symbol: "_double".into(),
                source: RouteError::NotPatchable(0x4000, "rejected".into()),
            }
        );
        assert!(binding.try_original().is_none());
    }

    #[test]
    #[should_panic(expected = "before its route was installed")]
    fn calling_through_empty_slot_panics() {
        binding().original();
    }
}
