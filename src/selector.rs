//! Event-driven patch selection.
//!
//! The loader calls [`Selector::register`] once, then delivers the kernel
//! hook and module load events. Every action is best-effort: a failure is
//! logged and reported in the returned outcomes, the rest still runs.

use log::*;

use crate::config::{Action, EraPolicy, FixupConfig};
use crate::error::SelectorError;
use crate::hooks::PagePolicy;
use crate::patcher::{KernelPatcher, KextInfo, LoadState};
use crate::patches::PatchDescriptor;
use crate::route::Intercept;
use crate::scan;
use crate::version::KernelVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Idle,
    AwaitingKernelHook,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    AwaitingModule,
    Done,
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Routed { symbol: &'static str, original: usize },
    /// Offsets are relative to the start of the loaded image.
    Patched { name: &'static str, offsets: Vec<usize> },
    NotFound { name: &'static str },
    Failed { action: String, reason: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

pub struct Selector {
    config: FixupConfig,
    state: SelectorState,
    era: Option<usize>,
    /// Parallel to `config.kexts`; `None` when the era has nothing for it.
    targets: Vec<Option<TargetState>>,
}

impl Selector {
    pub fn new(config: FixupConfig) -> Self {
        let targets = vec![None; config.kexts.len()];
        Selector {
            config,
            state: SelectorState::Idle,
            era: None,
            targets,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn config(&self) -> &FixupConfig {
        &self.config
    }

    pub fn era(&self) -> Option<&EraPolicy> {
        self.era.map(|era| &self.config.eras[era])
    }

    pub fn kexts(&self) -> &[KextInfo] {
        &self.config.kexts
    }

    /// Lets the loader drive the load state of a watched kext.
    pub fn kext_mut(&mut self, kext: usize) -> Option<&mut KextInfo> {
        self.config.kexts.get_mut(kext)
    }

    pub fn target_state(&self, kext: usize) -> Option<TargetState> {
        self.targets.get(kext).copied().flatten()
    }

    /// Selects the era for `version` and returns the kexts to watch.
    pub fn register(&mut self, version: KernelVersion) -> Result<Vec<usize>, SelectorError> {
        if self.state != SelectorState::Idle {
            return Err(SelectorError::AlreadyRegistered);
        }

        let era = self.config.era_for(version)?;
        let policy = &self.config.eras[era];
        info!("Kernel {} uses the {} patch set", version, policy.name);

        let mut watched = Vec::new();
        for (kext, target) in self.targets.iter_mut().enumerate() {
            if policy.actions_for(kext).is_empty() {
                continue;
            }
            *target = Some(TargetState::AwaitingModule);
            watched.push(kext);
        }

        self.era = Some(era);
        self.state = SelectorState::AwaitingKernelHook;
        Ok(watched)
    }

    /// One-shot: publishes the shared cache patch and routes page validation.
    pub fn on_kernel_hook(
        &mut self,
        patcher: &mut dyn KernelPatcher,
    ) -> Result<Vec<Outcome>, SelectorError> {
        match self.state {
            SelectorState::Idle => return Err(SelectorError::NotRegistered),
            SelectorState::Running => return Err(SelectorError::KernelHookDone),
            SelectorState::AwaitingKernelHook => {}
        }
        self.state = SelectorState::Running;
        let Some(era) = self.era() else {
            return Err(SelectorError::NotRegistered);
        };

        let policy = PagePolicy {
            descriptor: era.shared_cache.descriptor,
            cache_dir: era.shared_cache.cache_dir,
            vnode_path: patcher.vnode_path(),
        };
        if self.config.page_policy.set(policy).is_err() {
            warn!("Shared cache page policy was already published");
        }

        let routes = self.config.kernel_routes.clone();
        let outcomes = routes
            .into_iter()
            .map(|binding| install(binding, patcher))
            .collect();
        Ok(outcomes)
    }

    pub fn on_module_loaded(
        &mut self,
        patcher: &mut dyn KernelPatcher,
        index: usize,
        base: usize,
        size: usize,
    ) -> Result<Vec<Outcome>, SelectorError> {
        let Some(era) = self.era else {
            return Err(SelectorError::NotRegistered);
        };

        let Some(kext) = self.config.kexts.iter().enumerate().position(|(kext, info)| {
            self.targets[kext] == Some(TargetState::AwaitingModule)
                && info.load_state() == LoadState::Loading
                && info.load_index() == Some(index)
        }) else {
            debug!("Load index {} is not a watched kext", index);
            return Err(SelectorError::UnknownModule(index));
        };

        let info = &mut self.config.kexts[kext];
        debug!("Processing {} at {:#x} ({:#x} bytes)", info.id, base, size);
        if let Err(e) = info.finish_loading() {
            warn!("{}", e);
        }

        // Redirects first, then byte patches.
        let mut actions = self.config.eras[era].actions_for(kext).to_vec();
        actions.sort_by_key(|action| !action.is_route());

        let outcomes = actions
            .into_iter()
            .map(|action| match action {
                Action::Route(binding) => install(binding, patcher),
                Action::Lookup(descriptor) => {
                    let Some(image) = patcher.image_mut(base, size) else {
                        return failed(descriptor.name, "image is not accessible");
                    };
                    patch(descriptor, image, base)
                }
                Action::FunctionBody {
                    symbol,
                    descriptor,
                    window,
                } => patch_function_body(patcher, symbol, descriptor, window, base, size),
            })
            .collect();

        self.targets[kext] = Some(TargetState::Done);
        Ok(outcomes)
    }

    /// Patches stay in place for the lifetime of the process; nothing to undo.
    pub fn on_module_unloaded(&mut self, index: usize) {
        debug!("Load index {} unloaded", index);
    }
}

fn failed(action: &str, reason: impl ToString) -> Outcome {
    let reason = reason.to_string();
    error!("{}: {}", action, reason);
    Outcome::Failed {
        action: action.to_string(),
        reason,
    }
}

fn install(binding: &dyn Intercept, patcher: &mut dyn KernelPatcher) -> Outcome {
    match binding.install(patcher) {
        Ok(original) => Outcome::Routed {
            symbol: binding.symbol(),
            original,
        },
        Err(e) => failed(binding.symbol(), e),
    }
}

fn patch(descriptor: &'static PatchDescriptor, image: &mut [u8], base: usize) -> Outcome {
    let offsets = scan::scan(image, descriptor);
    if offsets.is_empty() {
        return Outcome::NotFound {
            name: descriptor.name,
        };
    }

    for offset in &offsets {
        info!("{} patched at {:#x}", descriptor.name, base + offset);
    }
    Outcome::Patched {
        name: descriptor.name,
        offsets,
    }
}

fn patch_function_body(
    patcher: &mut dyn KernelPatcher,
    symbol: &'static str,
    descriptor: &'static PatchDescriptor,
    window: usize,
    base: usize,
    size: usize,
) -> Outcome {
    let Some(entry) = patcher.resolve_symbol(descriptor.target, symbol) else {
        return failed(symbol, "symbol not found");
    };
    let end = base.saturating_add(size);
    if entry < base || entry >= end {
        return failed(symbol, format!("{:#x} is outside the loaded image", entry));
    }

    let len = window.min(end - entry);
    let Some(body) = patcher.image_mut(entry, len) else {
        return failed(symbol, "function body is not accessible");
    };
    match patch(descriptor, body, entry) {
        Outcome::Patched { name, offsets } => Outcome::Patched {
            name,
            offsets: offsets.into_iter().map(|offset| entry - base + offset).collect(),
        },
        outcome => outcome,
    }
}
