//! Userland host: plays the loader and kernel patcher against images on disk.
//!
//! Images are read into heap buffers whose address doubles as their load
//! base. Routes are recorded in an override table that symbol lookups
//! consult first, the same way a dynamic linker honours interposed symbols,
//! so the original code stays intact and callable at its own address.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use goblin::mach::{cputype::CPU_TYPE_X86_64, Mach, MachO};
use libc::{c_int, c_void};
use log::*;

use crate::error::RouteError;
use crate::hooks::{CsValidatePageFn, CS_VALIDATE_PAGE_SYMBOL, PAGE_SIZE};
use crate::patcher::{KernelPatcher, ModuleRef, Vnode, VnodePathFn};
use crate::route::FunctionHandle;
use crate::selector::{Outcome, Selector};
use crate::version::KernelVersion;

#[derive(Debug)]
pub struct ModuleImage {
    pub module: ModuleRef,
    pub path: PathBuf,
    bytes: Vec<u8>,
    /// Symbol name to file offset.
    symbols: HashMap<String, usize>,
}

impl ModuleImage {
    pub fn load(module: ModuleRef, path: &Path) -> anyhow::Result<Self> {
        debug!("Reading image: {}", path.display());
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(module, path, bytes))
    }

    /// Images goblin cannot parse are kept as raw bytes without symbols.
    pub fn from_bytes(module: ModuleRef, path: &Path, bytes: Vec<u8>) -> Self {
        let mut symbols = match parse_symbols(&bytes) {
            Ok(symbols) => symbols,
            Err(e) => {
                debug!("No symbols for {}: {}", path.display(), e);
                HashMap::new()
            }
        };
        symbols.retain(|_, offset| *offset < bytes.len());
        debug!("{}: {} bytes, {} symbols", path.display(), bytes.len(), symbols.len());

        ModuleImage {
            module,
            path: path.to_path_buf(),
            bytes,
            symbols,
        }
    }

    /// Adds a symbol known from elsewhere, e.g. a prelinked symbol map.
    pub fn define_symbol(&mut self, name: &str, offset: usize) {
        self.symbols.insert(name.to_string(), offset);
    }

    pub fn base(&self) -> usize {
        self.bytes.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).map(|offset| self.base() + offset)
    }

    fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base()
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.base() + self.size())
    }
}

fn parse_symbols(bytes: &[u8]) -> anyhow::Result<HashMap<String, usize>> {
    match goblin::Object::parse(bytes)? {
        goblin::Object::Elf(elf) => Ok(elf_symbols(&elf)),
        goblin::Object::Mach(Mach::Binary(macho)) => Ok(macho_symbols(&macho, 0)),
        goblin::Object::Mach(Mach::Fat(fat)) => {
            let arch = fat
                .find_cputype(CPU_TYPE_X86_64)?
                .ok_or_else(|| anyhow!("fat image has no x86_64 slice"))?;
            let offset = arch.offset as usize;
            let macho = MachO::parse(bytes, offset)?;
            Ok(macho_symbols(&macho, offset))
        }
        _ => Err(anyhow!("not an ELF or Mach-O image")),
    }
}

fn elf_symbols(elf: &goblin::elf::Elf) -> HashMap<String, usize> {
    let file_offset = |sym: &goblin::elf::Sym| -> Option<usize> {
        let vaddr = sym.st_value;
        let mapped = elf.program_headers.iter().find(|ph| {
            ph.p_type == goblin::elf::program_header::PT_LOAD
                && vaddr >= ph.p_vaddr
                && ph.p_vaddr.checked_add(ph.p_filesz).is_some_and(|end| vaddr < end)
        });
        match mapped {
            Some(ph) => (vaddr - ph.p_vaddr).checked_add(ph.p_offset).map(|offset| offset as usize),
            None => {
                let section = elf.section_headers.get(sym.st_shndx)?;
                let delta = vaddr.checked_sub(section.sh_addr)?;
                section.sh_offset.checked_add(delta).map(|offset| offset as usize)
            }
        }
    };

    let mut symbols = HashMap::new();
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in tables {
        for sym in syms.iter() {
            if sym.st_shndx == 0 || sym.st_value == 0 {
                continue;
            }
            let (Some(name), Some(offset)) = (strtab.get_at(sym.st_name), file_offset(&sym)) else {
                continue;
            };
            if !name.is_empty() {
                symbols.insert(name.to_string(), offset);
            }
        }
    }
    symbols
}

fn macho_symbols(macho: &MachO, slice_offset: usize) -> HashMap<String, usize> {
    let mut symbols = HashMap::new();
    for (name, nlist) in macho.symbols().flatten() {
        if nlist.is_undefined() || nlist.n_value == 0 {
            continue;
        }
        let Some(seg) = macho.segments.iter().find(|seg| {
            nlist.n_value >= seg.vmaddr
                && seg.vmaddr.checked_add(seg.filesize).is_some_and(|end| nlist.n_value < end)
        }) else {
            continue;
        };
        let offset = (nlist.n_value - seg.vmaddr)
            .checked_add(seg.fileoff)
            .and_then(|offset| usize::try_from(offset).ok())
            .and_then(|offset| offset.checked_add(slice_offset));
        if let Some(offset) = offset {
            symbols.insert(name.to_string(), offset);
        }
    }
    symbols
}

/// Interprets a vnode as a pointer to a NUL-terminated path.
pub fn cstr_vnode_path(vp: Vnode) -> Option<String> {
    if vp.is_null() {
        return None;
    }
    // SAFETY: this host only ever passes `CString` pointers as vnodes.
    let path = unsafe { CStr::from_ptr(vp as *const libc::c_char) };
    path.to_str().ok().map(str::to_string)
}

/// Stand-in for the kernel's page validator: accepts every page.
unsafe extern "C" fn host_cs_validate_page(
    _vp: Vnode,
    _pager: *mut c_void,
    _page_offset: u64,
    _data: *const c_void,
    validated_p: *mut c_int,
    _tainted_p: *mut c_int,
    _nx_p: *mut c_int,
) {
    if let Some(validated) = unsafe { validated_p.as_mut() } {
        *validated = 1;
    }
}

pub struct UserlandPatcher {
    images: Vec<ModuleImage>,
    kernel_symbols: HashMap<String, usize>,
    /// Target address to replacement address.
    routes: HashMap<usize, usize>,
}

impl Default for UserlandPatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UserlandPatcher {
    pub fn new() -> Self {
        let mut kernel_symbols = HashMap::new();
        kernel_symbols.insert(
            CS_VALIDATE_PAGE_SYMBOL.to_string(),
            (host_cs_validate_page as CsValidatePageFn).address(),
        );
        UserlandPatcher {
            images: Vec::new(),
            kernel_symbols,
            routes: HashMap::new(),
        }
    }

    pub fn add_image(&mut self, image: ModuleImage) -> usize {
        self.images.push(image);
        self.images.len() - 1
    }

    pub fn images(&self) -> &[ModuleImage] {
        &self.images
    }

    fn raw_symbol(&self, module: ModuleRef, name: &str) -> Option<usize> {
        match module {
            ModuleRef::Kernel => self.kernel_symbols.get(name).copied(),
            ModuleRef::Kext(_) => self
                .images
                .iter()
                .filter(|image| image.module == module)
                .find_map(|image| image.symbol(name)),
        }
    }

    /// Symbol lookup as callers of the module see it, routes applied.
    pub fn lookup(&self, module: ModuleRef, name: &str) -> Option<usize> {
        let address = self.raw_symbol(module, name)?;
        Some(self.routes.get(&address).copied().unwrap_or(address))
    }

    /// Feeds `bytes` through the (possibly routed) page validator one page
    /// at a time, as if paged in from `path`. Returns the number of pages
    /// that changed.
    pub fn validate_pages(&self, path: &str, bytes: &mut [u8]) -> anyhow::Result<usize> {
        let entry = self
            .lookup(ModuleRef::Kernel, CS_VALIDATE_PAGE_SYMBOL)
            .ok_or_else(|| anyhow!("{} is not available", CS_VALIDATE_PAGE_SYMBOL))?;
        // SAFETY: kernel symbols and their routes all carry the validator signature.
        let validate = unsafe { CsValidatePageFn::from_address(entry) };
        let vnode = CString::new(path)?;

        let mut changed = 0;
        let mut page = vec![0u8; PAGE_SIZE];
        for (index, chunk) in bytes.chunks_mut(PAGE_SIZE).enumerate() {
            page.fill(0);
            page[..chunk.len()].copy_from_slice(chunk);

            let (mut validated, mut tainted, mut nx) = (0, 0, 0);
            unsafe {
                validate(
                    vnode.as_ptr() as Vnode,
                    std::ptr::null_mut(),
                    (index * PAGE_SIZE) as u64,
                    page.as_mut_ptr() as *const c_void,
                    &mut validated,
                    &mut tainted,
                    &mut nx,
                )
            };
            if validated == 0 {
                warn!("Page {} of {} failed validation", index, path);
            }

            if page[..chunk.len()] != *chunk {
                chunk.copy_from_slice(&page[..chunk.len()]);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

impl KernelPatcher for UserlandPatcher {
    fn resolve_symbol(&mut self, module: ModuleRef, name: &str) -> Option<usize> {
        self.raw_symbol(module, name)
    }

    fn route(&mut self, target: usize, replacement: usize) -> Result<usize, RouteError> {
        let known = self.kernel_symbols.values().any(|&address| address == target)
            || self.images.iter().any(|image| image.contains(target, 1));
        if !known {
            return Err(RouteError::OutOfImage(target));
        }
        if self.routes.contains_key(&target) {
            return Err(RouteError::AlreadyRouted(target));
        }
        self.routes.insert(target, replacement);
        Ok(target)
    }

    fn image_mut(&mut self, base: usize, size: usize) -> Option<&mut [u8]> {
        let image = self.images.iter_mut().find(|image| image.contains(base, size))?;
        let offset = base - image.base();
        image.bytes.get_mut(offset..offset + size)
    }

    fn vnode_path(&self) -> VnodePathFn {
        cstr_vnode_path
    }
}

/// The running kernel's version, `None` when not on Darwin.
pub fn current_kernel_version() -> Option<KernelVersion> {
    // SAFETY: utsname is plain data and uname fills it in.
    let mut name: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }
    let sysname = unsafe { CStr::from_ptr(name.sysname.as_ptr()) };
    if sysname.to_bytes() != b"Darwin" {
        return None;
    }
    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    KernelVersion::from_release(release.to_str().ok()?)
}

/// Loads a watched kext from `path` and delivers its load event.
pub fn load_kext(
    selector: &mut Selector,
    patcher: &mut UserlandPatcher,
    kext: usize,
    path: &Path,
) -> anyhow::Result<Vec<Outcome>> {
    let id = selector
        .kexts()
        .get(kext)
        .map(|info| info.id)
        .ok_or_else(|| anyhow!("no kext at index {}", kext))?;

    let image = ModuleImage::load(ModuleRef::Kext(id), path)?;
    let (base, size) = (image.base(), image.size());
    patcher.add_image(image);

    if let Some(info) = selector.kext_mut(kext) {
        info.begin_loading(kext)?;
    }
    info!("Loaded {} at {:#x}", id, base);
    Ok(selector.on_module_loaded(patcher, kext, base, size)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_images_have_no_symbols() {
        let image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("raw"), vec![0; 32]);
        assert_eq!(image.size(), 32);
        assert_eq!(image.path, Path::new("raw"));
        assert_eq!(image.symbol("_anything"), None);
    }

    #[test]
    fn defined_symbols_are_absolute() {
        let mut image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("raw"), vec![0; 32]);
        image.define_symbol("_f", 8);
        assert_eq!(image.symbol("_f"), Some(image.base() + 8));
    }

    /// Minimal ELF64 with one PT_LOAD segment and a single symbol `_f`.
    fn elf_with_symbol(p_vaddr: u64, p_filesz: u64, st_value: u64) -> Vec<u8> {
        let mut elf = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&0x3eu16.to_le_bytes());
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&176u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes());
        for field in [64u16, 56, 1, 64, 3, 2] {
            elf.extend_from_slice(&field.to_le_bytes());
        }

        // PT_LOAD
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&5u32.to_le_bytes());
        for field in [0, p_vaddr, p_vaddr, p_filesz, p_filesz, 0x1000] {
            elf.extend_from_slice(&field.to_le_bytes());
        }

        // .strtab at 120, .symtab at 128
        elf.extend_from_slice(b"\0_f\0\0\0\0\0");
        elf.extend_from_slice(&[0; 24]);
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&[0x12, 0]);
        elf.extend_from_slice(&1u16.to_le_bytes());
        elf.extend_from_slice(&st_value.to_le_bytes());
        elf.extend_from_slice(&0u64.to_le_bytes());

        let section = |elf: &mut Vec<u8>, kind: u32, offset: u64, size: u64, link: u32, info: u32, entsize: u64| {
            elf.extend_from_slice(&0u32.to_le_bytes());
            elf.extend_from_slice(&kind.to_le_bytes());
            for field in [0u64, 0, offset, size] {
                elf.extend_from_slice(&field.to_le_bytes());
            }
            elf.extend_from_slice(&link.to_le_bytes());
            elf.extend_from_slice(&info.to_le_bytes());
            elf.extend_from_slice(&8u64.to_le_bytes());
            elf.extend_from_slice(&entsize.to_le_bytes());
        };
        elf.extend_from_slice(&[0; 64]);
        section(&mut elf, 2, 128, 48, 2, 1, 24);
        section(&mut elf, 3, 120, 4, 0, 0, 0);
        elf
    }

    #[test]
    fn elf_symbols_map_to_file_offsets() {
        let bytes = elf_with_symbol(0x1000, 0x200, 0x1010);
        let image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("k.elf"), bytes);
        assert_eq!(image.symbol("_f"), Some(image.base() + 0x10));
    }

    #[test]
    fn wrapping_segment_bounds_are_skipped() {
        let bytes = elf_with_symbol(0xffff_ffff_ffff_f000, 0x2000, 0xffff_ffff_ffff_f800);
        let image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("k.elf"), bytes);
        assert_eq!(image.symbol("_f"), None);
    }

    #[test]
    fn routes_shadow_symbol_lookup() {
        let mut patcher = UserlandPatcher::new();
        let mut image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("raw"), vec![0; 32]);
        image.define_symbol("_f", 4);
        let target = image.symbol("_f").unwrap();
        patcher.add_image(image);

        assert_eq!(patcher.resolve_symbol(ModuleRef::Kext("k"), "_f"), Some(target));
        assert_eq!(patcher.route(target, 0xdead), Ok(target));
        assert_eq!(patcher.lookup(ModuleRef::Kext("k"), "_f"), Some(0xdead));
        assert_eq!(patcher.resolve_symbol(ModuleRef::Kext("k"), "_f"), Some(target));
        assert_eq!(patcher.route(target, 0xbeef), Err(RouteError::AlreadyRouted(target)));
        assert_eq!(patcher.route(0x10, 0xbeef), Err(RouteError::OutOfImage(0x10)));
        assert_eq!(patcher.lookup(ModuleRef::Kext("other"), "_f"), None);
    }

    #[test]
    fn image_views_stay_in_bounds() {
        let mut patcher = UserlandPatcher::new();
        let image = ModuleImage::from_bytes(ModuleRef::Kext("k"), Path::new("raw"), (0..16).collect());
        let base = image.base();
        patcher.add_image(image);

        assert_eq!(patcher.image_mut(base + 4, 4).unwrap(), &[4, 5, 6, 7]);
        assert!(patcher.image_mut(base + 12, 8).is_none());
        assert!(patcher.image_mut(base - 1, 2).is_none());
    }

    #[test]
    fn unrouted_validator_leaves_pages_alone() {
        let patcher = UserlandPatcher::new();
        let mut bytes = vec![0x5a; PAGE_SIZE + 100];
        let changed = patcher
            .validate_pages("/System/Library/dyld/dyld_shared_cache_x86_64h", &mut bytes)
            .unwrap();
        assert_eq!(changed, 0);
        assert!(bytes.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn vnode_paths_round_trip() {
        let path = CString::new("/tmp/x").unwrap();
        assert_eq!(cstr_vnode_path(path.as_ptr() as Vnode).as_deref(), Some("/tmp/x"));
        assert_eq!(cstr_vnode_path(std::ptr::null_mut()), None);
    }
}
