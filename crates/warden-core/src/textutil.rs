//! Byte-budget truncation and the Windows code-page conversions applied to
//! script content and task output when the system language is not en-US.

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
pub fn safe_truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// UTF-8 → GBK, used before writing script files on non-en-US Windows.
pub fn utf8_to_gbk(s: &str) -> Vec<u8> {
    let (bytes, _, _) = encoding_rs::GBK.encode(s);
    bytes.into_owned()
}

/// GBK → UTF-8, used on captured output before reporting. Undecodable
/// sequences are replaced rather than dropped.
pub fn gbk_to_utf8(bytes: &[u8]) -> String {
    let (text, _, _) = encoding_rs::GBK.decode(bytes);
    text.into_owned()
}

/// The en-US language id; conversions are skipped when the system default
/// matches it.
pub const LANG_EN_US: u32 = 0x409;

#[cfg(windows)]
pub fn default_lang_id() -> u32 {
    u32::from(unsafe { windows_sys::Win32::Globalization::GetSystemDefaultUILanguage() })
}

#[cfg(not(windows))]
pub fn default_lang_id() -> u32 {
    LANG_EN_US
}

/// Whether script/output bytes must be converted between UTF-8 and GBK.
pub fn needs_codepage_conversion() -> bool {
    cfg!(windows) && default_lang_id() != LANG_EN_US
}
