use log::*;

use crate::patches::PatchDescriptor;

/// Replaces up to `count` non-overlapping occurrences of `needle` in place.
///
/// Returns the offsets that were rewritten, in ascending order. Bytes are only
/// written once a full match is confirmed, so a miss leaves `haystack` untouched.
pub fn search_and_patch(
    haystack: &mut [u8],
    needle: &[u8],
    replacement: &[u8],
    count: usize,
) -> Vec<usize> {
    let mut offsets = Vec::new();
    if needle.is_empty() || needle.len() > haystack.len() || needle.len() != replacement.len() {
        return offsets;
    }

    let mut start = 0;
    while offsets.len() < count && haystack.len() - start >= needle.len() {
        let Some(found) = haystack[start..]
            .windows(needle.len())
            .position(|window| window == needle)
        else {
            break;
        };

        let offset = start + found;
        haystack[offset..offset + needle.len()].copy_from_slice(replacement);
        offsets.push(offset);
        start = offset + needle.len();
    }

    offsets
}

/// Applies `descriptor` to `haystack` and returns the patched offsets.
pub fn scan(haystack: &mut [u8], descriptor: &PatchDescriptor) -> Vec<usize> {
    let offsets = search_and_patch(
        haystack,
        descriptor.needle(),
        descriptor.replacement(),
        descriptor.count(),
    );
    if offsets.is_empty() {
        debug!("{}: signature not present", descriptor.name);
    } else {
        debug!("{}: patched {} occurrence(s)", descriptor.name, offsets.len());
    }
    offsets
}
