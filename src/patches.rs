//! Opaque find/replace patches and the shipped signature tables.

use crate::patcher::ModuleRef;

pub const AMD_RADEON_X4000_ID: &str = "com.apple.kext.AMDRadeonX4000";
pub const AMD_RADEON_X4000_HWLIBS_ID: &str = "com.apple.kext.AMDRadeonX4000HWLibs";

/// A needle and the bytes that overwrite it.
///
/// Both sides are taken as `&[u8; N]` so a length mismatch does not compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub name: &'static str,
    pub target: ModuleRef,
    needle: &'static [u8],
    replacement: &'static [u8],
    count: usize,
}

impl PatchDescriptor {
    pub const fn new<const N: usize>(
        name: &'static str,
        target: ModuleRef,
        needle: &'static [u8; N],
        replacement: &'static [u8; N],
    ) -> Self {
        assert!(N > 0, "patch needle must not be empty");
        PatchDescriptor {
            name,
            target,
            needle,
            replacement,
            count: 1,
        }
    }

    /// Patch up to `count` occurrences instead of the first one only.
    pub const fn with_count(mut self, count: usize) -> Self {
        assert!(count >= 1, "patch count must be at least 1");
        self.count = count;
        self
    }

    pub fn needle(&self) -> &'static [u8] {
        self.needle
    }

    pub fn replacement(&self) -> &'static [u8] {
        self.replacement
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.needle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needle.is_empty()
    }
}

// AddrLib::GetBaseArrayMode in AMDBronzeMtlAddrLib (shared cache): the tail
// `add eax, eax` becomes `xor eax, eax` so the even branch is always taken.

pub static ARRAY_MODE_MONTEREY: PatchDescriptor = PatchDescriptor::new(
    "AddrLib::GetBaseArrayMode",
    ModuleRef::Kernel,
    &[
        0x0f, 0xb6, 0xc1, 0xeb, 0x09, 0x31, 0xc0, 0xf6, 0x47, 0x08, 0xc0, 0x0f, 0x95, 0xc0, 0x01,
        0xc0, 0x83, 0xc0, 0x02, 0x5d, 0xc3, 0x55,
    ],
    &[
        0x0f, 0xb6, 0xc1, 0xeb, 0x09, 0x31, 0xc0, 0xf6, 0x47, 0x08, 0xc0, 0x0f, 0x95, 0xc0, 0x31,
        0xc0, 0x83, 0xc0, 0x02, 0x5d, 0xc3, 0x55,
    ],
);

pub static ARRAY_MODE_SEQUOIA: PatchDescriptor = PatchDescriptor::new(
    "AddrLib::GetBaseArrayMode",
    ModuleRef::Kernel,
    &[
        0x0f, 0xb6, 0xc1, 0xeb, 0x0b, 0x31, 0xc0, 0xf6, 0x47, 0x08, 0xc0, 0x0f, 0x95, 0xc0, 0x01,
        0xc0, 0x83, 0xc0, 0x02, 0x5d, 0xc3,
    ],
    &[
        0x0f, 0xb6, 0xc1, 0xeb, 0x0b, 0x31, 0xc0, 0xf6, 0x47, 0x08, 0xc0, 0x0f, 0x95, 0xc0, 0x31,
        0xc0, 0x83, 0xc0, 0x02, 0x5d, 0xc3,
    ],
);

// CAIL_DDI_CAPS_POLARIS22_A0: one capability bit cleared (byte 44, 0x03 -> 0x02).
pub static CAIL_DDI_CAPS_POLARIS22_A0: PatchDescriptor = PatchDescriptor::new(
    "CAIL_DDI_CAPS_POLARIS22_A0",
    ModuleRef::Kext(AMD_RADEON_X4000_HWLIBS_ID),
    &[
        0x05, 0x00, 0x80, 0x00, 0xfe, 0x11, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00,
        0x11, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x68, 0x00, 0x00, 0x40, 0x29, 0x02, 0x40,
        0x00, 0x00, 0x01, 0x01, 0x8a, 0x62, 0x10, 0x86, 0xa2, 0x41, 0x00, 0x00, 0x00, 0x22, 0x03,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ],
    &[
        0x05, 0x00, 0x80, 0x00, 0xfe, 0x11, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00,
        0x11, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x68, 0x00, 0x00, 0x40, 0x29, 0x02, 0x40,
        0x00, 0x00, 0x01, 0x01, 0x8a, 0x62, 0x10, 0x86, 0xa2, 0x41, 0x00, 0x00, 0x00, 0x22, 0x02,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ],
);

// Firmware load gate prologue rewritten to `xor eax, eax; ret`.
pub static FIRMWARE_LOAD_GATE_BODY: PatchDescriptor = PatchDescriptor::new(
    "AMDHardware::isFirmwareLoadEnabled",
    ModuleRef::Kext(AMD_RADEON_X4000_ID),
    &[0x55, 0x48, 0x89, 0xe5, 0x53, 0x50],
    &[0x31, 0xc0, 0xc3, 0x90, 0x90, 0x90],
);

/// Every descriptor shipped in the policy table.
pub static ALL: [&PatchDescriptor; 4] = [
    &ARRAY_MODE_MONTEREY,
    &ARRAY_MODE_SEQUOIA,
    &CAIL_DDI_CAPS_POLARIS22_A0,
    &FIRMWARE_LOAD_GATE_BODY,
];
