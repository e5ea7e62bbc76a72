//! UTF-16 string conversion helpers.

/// Encodes a string as NUL-terminated UTF-16.
pub fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(core::iter::once(0)).collect()
}

/// Decodes UTF-16, stopping at the first NUL.
pub fn from_wide(wide: &[u16]) -> String {
    let end = wide.iter().position(|&unit| unit == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..end])
}

/// Case-insensitive comparison over full Unicode lowercasing, matching the
/// case-blind name rules of the object namespace.
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Decodes a counted native string.
///
/// # Safety
///
/// `value.Buffer` must point at `value.Length` bytes of readable memory in
/// the current process, or be null.
#[cfg(windows)]
pub(crate) unsafe fn from_unicode_string(
    value: &winapi::shared::ntdef::UNICODE_STRING,
) -> String {
    if value.Buffer.is_null() || value.Length == 0 {
        return String::new();
    }
    // SAFETY: bounds come from the contract above; Length counts bytes.
    let units =
        unsafe { core::slice::from_raw_parts(value.Buffer, (value.Length / 2) as usize) };
    String::from_utf16_lossy(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_round_trip_terminates_and_trims() {
        let wide = to_wide("ntdll.dll");
        assert_eq!(wide.last(), Some(&0));
        assert_eq!(from_wide(&wide), "ntdll.dll");
    }

    #[test]
    fn decoding_stops_at_embedded_nul() {
        let wide = [0x66, 0x6F, 0x6F, 0, 0x62, 0x61, 0x72];
        assert_eq!(from_wide(&wide), "foo");
    }

    #[test]
    fn name_comparison_ignores_case() {
        assert!(eq_ignore_case("Foo", "foo"));
        assert!(eq_ignore_case("BaseNamedObjects", "basenamedobjects"));
        assert!(!eq_ignore_case("foo", "food"));
        assert!(!eq_ignore_case("foo", "bar"));
    }
}
