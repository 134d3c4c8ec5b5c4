pub fn u8s_to_u16(a: u8, b: u8) -> u16 {
    ((a as u16) << 8) | (b as u16)
}

/// Drops the trailing root label dot of a fully qualified name.
pub fn trim_root(name: &str) -> &str {
    match name.strip_suffix('.') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => name,
    }
}
