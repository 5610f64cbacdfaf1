use std::path::Path;

use polaris22_fixup::config::{AMD_RADEON_X4000, AMD_RADEON_X4000_HWLIBS};
use polaris22_fixup::hooks::{self, PAGE_SIZE};
use polaris22_fixup::host::{ModuleImage, UserlandPatcher};
use polaris22_fixup::patches::{
    ARRAY_MODE_MONTEREY, ARRAY_MODE_SEQUOIA, AMD_RADEON_X4000_ID, FIRMWARE_LOAD_GATE_BODY,
};
use polaris22_fixup::selector::TargetState;
use polaris22_fixup::{BootFlags, KernelVersion, ModuleRef, Outcome, SelectorError};

const SHARED_CACHE: &str =
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld/dyld_shared_cache_x86_64";

#[test]
fn sequoia_needs_beta_flag() {
    let err = polaris22_fixup::plugin_start(BootFlags::default(), KernelVersion::SEQUOIA).err();
    assert_eq!(err, Some(SelectorError::UnsupportedVersion(KernelVersion::SEQUOIA)));

    let off = BootFlags::from_boot_args("-polaris22off -polaris22beta");
    let err = polaris22_fixup::plugin_start(off, KernelVersion::SEQUOIA).err();
    assert_eq!(err, Some(SelectorError::Disabled));
}

#[test]
fn sequoia_patches_firmware_gate_body() {
    let flags = BootFlags::from_boot_args("-polaris22beta");
    let (mut selector, watched) = polaris22_fixup::plugin_start(flags, KernelVersion::SEQUOIA).unwrap();
    assert_eq!(watched, vec![AMD_RADEON_X4000]);
    assert_eq!(selector.target_state(AMD_RADEON_X4000_HWLIBS), None);

    let mut patcher = UserlandPatcher::new();
    let outcomes = selector.on_kernel_hook(&mut patcher).unwrap();
    assert!(outcomes.iter().all(|outcome| !outcome.is_failure()));

    // Same prologue twice: only the resolved function is rewritten.
    let prologue = FIRMWARE_LOAD_GATE_BODY.needle();
    let mut bytes = vec![0x90; 0x1000];
    bytes[0x40..0x40 + prologue.len()].copy_from_slice(prologue);
    bytes[0x200..0x200 + prologue.len()].copy_from_slice(prologue);
    let mut expected = bytes.clone();
    expected[0x200..0x200 + prologue.len()].copy_from_slice(FIRMWARE_LOAD_GATE_BODY.replacement());

    let mut image = ModuleImage::from_bytes(
        ModuleRef::Kext(AMD_RADEON_X4000_ID),
        Path::new("AMDRadeonX4000"),
        bytes,
    );
    image.define_symbol(hooks::GET_HARDWARE_INFO_SYMBOL, 0x100);
    image.define_symbol(hooks::FIRMWARE_LOAD_GATE_SYMBOL, 0x200);
    let (base, size) = (image.base(), image.size());
    patcher.add_image(image);
    selector
        .kext_mut(AMD_RADEON_X4000)
        .unwrap()
        .begin_loading(7)
        .unwrap();

    let outcomes = selector.on_module_loaded(&mut patcher, 7, base, size).unwrap();
    assert_eq!(
        outcomes,
        vec![
            Outcome::Routed {
                symbol: hooks::GET_HARDWARE_INFO_SYMBOL,
                original: base + 0x100
            },
            Outcome::Patched {
                name: FIRMWARE_LOAD_GATE_BODY.name,
                offsets: vec![0x200]
            },
        ]
    );
    assert_eq!(patcher.images()[0].bytes(), expected.as_slice());
    assert_eq!(selector.target_state(AMD_RADEON_X4000), Some(TargetState::Done));
    assert_eq!(
        patcher.lookup(ModuleRef::Kext(AMD_RADEON_X4000_ID), hooks::FIRMWARE_LOAD_GATE_SYMBOL),
        Some(base + 0x200)
    );

    // The older shared cache signature no longer applies.
    let mut cache = vec![0u8; PAGE_SIZE];
    cache[..ARRAY_MODE_MONTEREY.len()].copy_from_slice(ARRAY_MODE_MONTEREY.needle());
    assert_eq!(patcher.validate_pages(SHARED_CACHE, &mut cache).unwrap(), 0);

    let mut cache = vec![0u8; PAGE_SIZE + 512];
    let at = PAGE_SIZE + 16;
    cache[at..at + ARRAY_MODE_SEQUOIA.len()].copy_from_slice(ARRAY_MODE_SEQUOIA.needle());
    assert_eq!(patcher.validate_pages(SHARED_CACHE, &mut cache).unwrap(), 1);
    assert_eq!(
        &cache[at..at + ARRAY_MODE_SEQUOIA.len()],
        ARRAY_MODE_SEQUOIA.replacement()
    );
}
