//! Path prefix handling shared by the file operations.

/// Case-insensitive prefix test that never splits a UTF-8 boundary.
pub fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    path.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Rewrites an NT path into its DOS form.
///
/// Recognized shapes, tried in order: an explicit `\??\` prefix is stripped;
/// `\SystemRoot` and a bare `system32\` are anchored at `system_root`
/// (e.g. `C:\Windows`); a `\Device\...` path is matched against the supplied
/// drive-to-device-link table. Anything else passes through unchanged.
pub fn translate_nt_path(path: &str, system_root: &str, devices: &[(String, String)]) -> String {
    if let Some(rest) = path.strip_prefix("\\??\\") {
        return rest.to_string();
    }
    if starts_with_ignore_case(path, "\\SystemRoot") {
        return format!("{}{}", system_root, &path["\\SystemRoot".len()..]);
    }
    if starts_with_ignore_case(path, "system32\\") {
        return format!("{}\\system32{}", system_root, &path["system32".len()..]);
    }
    if starts_with_ignore_case(path, "\\Device") {
        for (drive, link) in devices {
            if !link.is_empty() && path.starts_with(link.as_str()) {
                return format!("{}{}", drive, &path[link.len()..]);
            }
        }
    }
    path.to_string()
}
