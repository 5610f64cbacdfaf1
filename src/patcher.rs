//! Interface to the host that loads driver modules and performs redirects.
//!
//! Everything here is implemented outside the patch engine: a kernel
//! extension framework in production, [`crate::host::UserlandPatcher`] when
//! running against images on disk, and recording mocks in tests.

use libc::c_void;

use crate::error::{LoadStateError, RouteError};

/// Which loaded image a patch or a symbol lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleRef {
    /// Kernel text, including pages validated on behalf of the shared cache.
    Kernel,
    /// A kext, by bundle identifier.
    Kext(&'static str),
}

/// Opaque vnode handle passed to the page validator.
pub type Vnode = *mut c_void;

/// Resolves the backing file path of a vnode.
pub type VnodePathFn = fn(Vnode) -> Option<String>;

pub trait KernelPatcher {
    /// Address of `name` inside `module`, if the module is loaded and exports it.
    fn resolve_symbol(&mut self, module: ModuleRef, name: &str) -> Option<usize>;

    /// Redirects control aimed at `target` to `replacement`.
    ///
    /// Returns the address through which the original behaviour stays callable.
    /// On error nothing may have been modified.
    fn route(&mut self, target: usize, replacement: usize) -> Result<usize, RouteError>;

    /// Writable view of `size` bytes of loaded image memory at `base`.
    fn image_mut(&mut self, base: usize, size: usize) -> Option<&mut [u8]>;

    /// Path resolver used by the page validation wrapper.
    fn vnode_path(&self) -> VnodePathFn;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

/// A kext the selector watches for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextInfo {
    pub id: &'static str,
    pub paths: &'static [&'static str],
    load_state: LoadState,
    load_index: Option<usize>,
}

impl KextInfo {
    pub const fn new(id: &'static str, paths: &'static [&'static str]) -> Self {
        KextInfo {
            id,
            paths,
            load_state: LoadState::Unloaded,
            load_index: None,
        }
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn load_index(&self) -> Option<usize> {
        self.load_index
    }

    /// Called by the loader once it picked this kext and assigned it an index.
    pub fn begin_loading(&mut self, index: usize) -> Result<(), LoadStateError> {
        self.advance(LoadState::Loading)?;
        self.load_index = Some(index);
        Ok(())
    }

    pub fn finish_loading(&mut self) -> Result<(), LoadStateError> {
        self.advance(LoadState::Loaded)
    }

    fn advance(&mut self, to: LoadState) -> Result<(), LoadStateError> {
        if to <= self.load_state {
            return Err(LoadStateError::Backwards {
                id: self.id,
                from: self.load_state,
                to,
            });
        }
        self.load_state = to;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;

    use super::*;

    /// Records routes and serves images out of plain vectors.
    #[derive(Default)]
    pub struct MockPatcher {
        pub symbols: HashMap<(ModuleRef, String), usize>,
        /// What `route` returns as the original entry for a target; the
        /// target itself when absent.
        pub originals: HashMap<usize, usize>,
        pub reject_routes: bool,
        pub routes: Vec<(usize, usize)>,
        pub images: Vec<(usize, Vec<u8>)>,
    }

    impl KernelPatcher for MockPatcher {
        fn resolve_symbol(&mut self, module: ModuleRef, name: &str) -> Option<usize> {
            self.symbols.get(&(module, name.to_string())).copied()
        }

        fn route(&mut self, target: usize, replacement: usize) -> Result<usize, RouteError> {
            if self.reject_routes {
                return Err(RouteError::NotPatchable(target, "rejected".into()));
            }
            self.routes.push((target, replacement));
            Ok(self.originals.get(&target).copied().unwrap_or(target))
        }

        fn image_mut(&mut self, base: usize, size: usize) -> Option<&mut [u8]> {
            self.images.iter_mut().find_map(|(start, bytes)| {
                let offset = base.checked_sub(*start)?;
                bytes.get_mut(offset..offset.checked_add(size)?)
            })
        }

        fn vnode_path(&self) -> VnodePathFn {
            |_| None
        }
    }
}
