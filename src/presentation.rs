//! Hex/text conversion and binary-detection helpers used to render received
//! bytes for display. A stateless set of pure functions (no instance
//! state, naturally thread-safe), kept as free functions in a module
//! rather than a struct of static methods since Rust has no use for the
//! latter.

const DEFAULT_BINARY_THRESHOLD: f64 = 0.3;
const DEFAULT_MAX_DISPLAY_SIZE: usize = 64 * 1024;

pub fn byte_to_hex(byte: u8) -> String {
    format!("{:02X}", byte)
}

pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| byte_to_hex(*b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn hex_char_to_value(c: char) -> Option<u8> {
    c.to_digit(16).map(|v| v as u8)
}

/// Strips a leading offset token (e.g. `"00000000:"`) from one line of a
/// `format_hex_ascii` dump, if present.
fn strip_offset_prefix(line: &str) -> &str {
    match line.find(':') {
        Some(i) if !line[..i].is_empty() && line[..i].chars().all(|c| c.is_ascii_hexdigit()) => {
            &line[i + 1..]
        }
        _ => line,
    }
}

/// Strips a trailing `|ascii|` gutter segment from one line of a
/// `format_hex_ascii` dump, if present.
fn strip_ascii_gutter(line: &str) -> &str {
    match line.find('|') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Parses hex text tolerant of separators (`"48656C6C6F"`, `"48 65 6C 6C 6F"`,
/// `"48-65-6C-6C-6F"`), stray non-hex characters (skipped), and the
/// offset-prefixed/ASCII-gutter line format `format_hex_ascii` produces
/// (`"00000000: 48 65 6C 6C 6F |Hello|"`). Odd-length input rounds down,
/// dropping a dangling trailing nibble.
pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    let mut digits: Vec<u8> = Vec::new();
    for line in hex.lines() {
        let line = strip_ascii_gutter(line);
        let line = strip_offset_prefix(line);
        digits.extend(line.chars().filter_map(hex_char_to_value));
    }
    let mut out = Vec::with_capacity(digits.len() / 2);
    let mut pairs = digits.chunks_exact(2);
    for pair in &mut pairs {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

pub fn bytes_to_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

pub fn text_to_bytes(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

pub fn is_printable(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte) || matches!(byte, b'\t' | b'\r' | b'\n')
}

/// Fraction of non-printable bytes exceeding `threshold` marks `data` as
/// binary rather than text.
pub fn is_binary_data(data: &[u8], threshold: f64) -> bool {
    if data.is_empty() {
        return false;
    }
    let non_printable = data.iter().filter(|&&b| !is_printable(b)).count();
    (non_printable as f64 / data.len() as f64) > threshold
}

pub fn is_binary_data_default(data: &[u8]) -> bool {
    is_binary_data(data, DEFAULT_BINARY_THRESHOLD)
}

/// Validates `data` as well-formed UTF-8 (1-4 byte sequences per the
/// standard), used to decide whether inbound bytes render as text or as a
/// hex+ASCII dump.
pub fn is_valid_utf8(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
}

/// Truncates `text` to at most `max_bytes`, backing off to the nearest
/// preceding UTF-8 character boundary so the result never ends mid-codepoint.
pub fn safe_truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Hex-and-ASCII dump, `bytes_per_line` bytes per row: an 8-digit offset
/// column, the row's hex bytes, and a `|ascii|` gutter with non-printable
/// bytes rendered as `.` — e.g. `"00000000: 48 65 6C 6C 6F |Hello|"`.
pub fn format_hex_ascii(data: &[u8], bytes_per_line: usize) -> String {
    let bytes_per_line = bytes_per_line.max(1);
    let mut out = String::new();
    for (line_index, chunk) in data.chunks(bytes_per_line).enumerate() {
        let offset = line_index * bytes_per_line;
        let hex_part = bytes_to_hex(chunk);
        let ascii_part: String = chunk
            .iter()
            .map(|&b| if is_printable(b) && b != b'\t' && b != b'\r' && b != b'\n' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:08X}: ", offset));
        out.push_str(&hex_part);
        out.push_str(" |");
        out.push_str(&ascii_part);
        out.push_str("|\n");
    }
    out
}

#[derive(Debug, Clone)]
pub struct DisplayUpdate {
    pub content: String,
    pub data_size: usize,
    pub is_binary: bool,
}

/// Prepares `cache` for display: hex dump if `hex_mode`, otherwise a binary
/// hex+ASCII dump or plain text depending on content, truncated to
/// `max_display_size` bytes.
pub fn prepare_display(cache: &[u8], hex_mode: bool, max_display_size: usize) -> DisplayUpdate {
    let max_display_size = if max_display_size == 0 {
        DEFAULT_MAX_DISPLAY_SIZE
    } else {
        max_display_size
    };
    let truncated = &cache[..cache.len().min(max_display_size)];
    let is_binary = is_binary_data_default(truncated);

    let content = if hex_mode {
        bytes_to_hex(truncated)
    } else if is_binary {
        format_hex_ascii(truncated, 16)
    } else if is_valid_utf8(truncated) {
        bytes_to_text(truncated)
    } else {
        format_hex_ascii(truncated, 16)
    };

    DisplayUpdate {
        content,
        data_size: truncated.len(),
        is_binary,
    }
}

pub fn prepare_display_default(cache: &[u8], hex_mode: bool) -> DisplayUpdate {
    prepare_display(cache, hex_mode, DEFAULT_MAX_DISPLAY_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let data = vec![0x48, 0x65, 0x6C, 0x6C, 0x6F];
        assert_eq!(bytes_to_hex(&data), "48 65 6C 6C 6F");
        assert_eq!(hex_to_bytes("48 65 6C 6C 6F"), data);
        assert_eq!(hex_to_bytes("48-65-6C-6C-6F"), data);
        assert_eq!(hex_to_bytes("48656C6C6F"), data);
    }

    #[test]
    fn hex_to_bytes_skips_stray_characters() {
        assert_eq!(hex_to_bytes("zz48 65zz"), vec![0x48, 0x65]);
    }

    #[test]
    fn binary_detection() {
        assert!(!is_binary_data_default(b"hello world\n"));
        assert!(is_binary_data_default(&[0u8, 1, 2, 3, 255, 254, 253, 252]));
    }

    #[test]
    fn utf8_validity() {
        assert!(is_valid_utf8("héllo".as_bytes()));
        assert!(!is_valid_utf8(&[0xff, 0xfe]));
    }

    #[test]
    fn safe_truncate_does_not_split_multibyte_chars() {
        let text = "héllo"; // 'é' is two bytes
        let truncated = safe_truncate_utf8(text, 2);
        assert!(text.is_char_boundary(truncated.len()));
    }

    #[test]
    fn format_hex_ascii_marks_nonprintable_as_dot() {
        let out = format_hex_ascii(&[0x41, 0x00, 0x42], 16);
        assert!(out.contains("A.B"));
    }

    #[test]
    fn format_hex_ascii_has_offset_column_and_gutter() {
        let out = format_hex_ascii(b"Hello", 16);
        assert!(out.starts_with("00000000: 48 65 6C 6C 6F"));
        assert!(out.contains("|Hello|"));
    }

    #[test]
    fn hex_to_bytes_parses_offset_dump_round_trip() {
        let data = b"Hello, world!".to_vec();
        let dump = format_hex_ascii(&data, 8);
        assert_eq!(hex_to_bytes(&dump), data);
    }

    #[test]
    fn prepare_display_chooses_text_for_plain_ascii() {
        let update = prepare_display_default(b"hello", false);
        assert!(!update.is_binary);
        assert_eq!(update.content, "hello");
    }
}
