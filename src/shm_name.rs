// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming for named page segments.
// Segment objects are called `<prefix>_<broker>_seg<index>`; names that
// exceed the platform shm name limit are shortened with an FNV-1a suffix.

/// FNV-1a 64-bit hash.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Maximum length for POSIX shm names. 0 disables truncation.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0;

/// Logical name of segment `index` belonging to broker `broker`.
pub fn segment_name(prefix: &str, broker: &str, index: usize) -> String {
    if prefix.is_empty() {
        format!("{broker}_seg{index}")
    } else {
        format!("{prefix}_{broker}_seg{index}")
    }
}

/// Produce a POSIX shm-safe name (leading '/').
///
/// When `SHM_NAME_MAX > 0` and the name is too long, the result is
/// `/<head>_<16 hex digits of fnv1a>` so that distinct segments of one broker
/// still map to distinct objects.
pub fn make_shm_name(name: &str) -> String {
    shorten(name, SHM_NAME_MAX)
}

fn shorten(name: &str, limit: usize) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if limit == 0 || full.len() <= limit {
        return full;
    }

    const SUFFIX_LEN: usize = 1 + 16;
    let head_len = limit.saturating_sub(SUFFIX_LEN + 1);
    let body = &full[1..];
    let mut head_end = head_len.min(body.len());
    while !body.is_char_boundary(head_end) {
        head_end -= 1;
    }

    format!("/{}_{:016x}", &body[..head_end], fnv1a_64(full.as_bytes()))
}
