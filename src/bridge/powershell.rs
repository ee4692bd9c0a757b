//! PowerShell command encoding and diagnostic decoding.
//!
//! Command text is opaque to the bridge: it is wrapped for transport and
//! never inspected or sanitized. The quoting helpers at the bottom of this
//! module are for callers that interpolate user-supplied values into command
//! text before handing it over.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use super::wsman::{elements, xml_unescape};

pub(crate) const POWERSHELL_PROGRAM: &str = "powershell.exe";

/// Prepended to every script; progress records would otherwise be serialized
/// onto the diagnostic stream.
pub(crate) const PROGRESS_PREAMBLE: &str = "$ProgressPreference = 'SilentlyContinue';";

const CLIXML_HEADER: &str = "#< CLIXML";

/// Base64 of the UTF-16LE script, as `-EncodedCommand` expects.
pub(crate) fn encode_script(script: &str) -> String {
    let wrapped = format!("{}{}", PROGRESS_PREAMBLE, script);
    let utf16: Vec<u8> = wrapped.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    BASE64.encode(utf16)
}

/// Arguments passed to [`POWERSHELL_PROGRAM`] for `script`.
pub(crate) fn command_arguments(script: &str) -> Vec<String> {
    vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-EncodedCommand".to_string(),
        encode_script(script),
    ]
}

/// Inverse of [`encode_script`], preamble included.
#[cfg(test)]
pub(crate) fn decode_script(encoded: &str) -> Option<String> {
    let bytes = BASE64.decode(encoded).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

/// Decode `_xHHHH_` escapes used by PowerShell serialization.
fn decode_hex_escapes(s: &str) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find("_x") {
        units.extend(rest[..pos].encode_utf16());
        let tail = &rest[pos..];
        let unit = tail
            .get(2..6)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .filter(|_| tail.as_bytes().get(6) == Some(&b'_'))
            .and_then(|hex| u16::from_str_radix(hex, 16).ok());
        match unit {
            Some(unit) => {
                units.push(unit);
                rest = &tail[7..];
            }
            None => {
                units.extend("_x".encode_utf16());
                rest = &tail[2..];
            }
        }
    }
    units.extend(rest.encode_utf16());
    String::from_utf16_lossy(&units)
}

/// Turn a diagnostic stream into plain text.
///
/// Text that is not CLIXML is returned unchanged. For CLIXML only error
/// records are kept; progress and other records are dropped.
pub(crate) fn decode_clixml(raw: &str) -> String {
    let Some(body) = raw.trim_start().strip_prefix(CLIXML_HEADER) else {
        return raw.to_string();
    };
    let text: String = elements(body, "S")
        .into_iter()
        .filter(|el| el.attr("S") == Some("Error"))
        .map(|el| decode_hex_escapes(&xml_unescape(el.text())))
        .collect();
    text.trim_end().to_string()
}

/// Quote `value` as a single-quoted PowerShell literal.
///
/// PowerShell treats the typographic single quotes as delimiters too, so
/// those are doubled along with `'`.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Escape `value` for embedding in a single-quoted `-like` pattern so that
/// wildcard and expansion characters match literally.
pub fn escape_like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '`' | '[' | ']' | '*' | '?' | '{' | '}' | '$' | '(' | ')' | '|' => {
                out.push('`');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}
