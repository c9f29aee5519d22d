//! Payload decoding
//!
//! The charset comes from the response's `Content-Type` parameter first. Markup
//! payloads that do not declare one there are sniffed for an in-document declaration
//! (`<meta charset>` for HTML, the `<?xml encoding?>` prolog for XML). Anything left
//! undeclared is UTF-8. Invalid sequences become replacement characters.

use encoding_rs::{Encoding, UTF_8};

/// How far into a payload in-document declarations are looked for
const SNIFF_LIMIT: usize = 1024;

/// Where an in-document charset declaration may live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declared {
    /// `<meta charset=..>` or `<meta http-equiv content="..; charset=..">`
    HtmlMeta,
    /// `<?xml version="1.0" encoding=".."?>`
    XmlProlog,
    /// No in-document declaration
    None,
}

/// Decodes `bytes` to a string
///
/// # Arguments
///
/// * `bytes` - The payload
/// * `content_type` - The response `Content-Type`, possibly empty
/// * `declared` - Which in-document declaration to fall back to
pub fn decode(bytes: &[u8], content_type: &str, declared: Declared) -> String {
    let encoding = header_charset(content_type)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| sniff(bytes, declared))
        .unwrap_or(UTF_8);

    // A byte order mark wins over every declaration
    let (text, used, malformed) = encoding.decode(bytes);
    if malformed {
        tracing::debug!("Replaced malformed {} sequences while decoding", used.name());
    }
    text.into_owned()
}

/// The `charset` parameter of a `Content-Type` value
pub fn header_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\''))
            .filter(|label| !label.is_empty())
    })
}

fn sniff(bytes: &[u8], declared: Declared) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(SNIFF_LIMIT)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();

    let label = match declared {
        Declared::HtmlMeta => meta_charset(&head),
        Declared::XmlProlog => head
            .find("<?xml")
            .and_then(|start| tag_at(&head, start, "?>"))
            .and_then(|tag| attr_value(tag, "encoding")),
        Declared::None => None,
    }?;

    // A document cannot declare itself UTF-16 in ASCII-compatible text
    Encoding::for_label(label.as_bytes()).map(Encoding::output_encoding)
}

fn meta_charset(head: &str) -> Option<&str> {
    let mut from = 0;
    while let Some(offset) = head[from..].find("<meta") {
        let start = from + offset;
        let tag = tag_at(head, start, ">")?;
        if let Some(label) = attr_value(tag, "charset") {
            return Some(label);
        }
        from = start + tag.len();
    }
    None
}

fn tag_at<'a>(head: &'a str, start: usize, close: &str) -> Option<&'a str> {
    let rest = &head[start..];
    rest.find(close).map(|end| &rest[..end])
}

/// Value following `name` and `=` in a tag, unquoted
///
/// Also finds `charset=` inside an http-equiv `content` value.
fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(offset) = tag[from..].find(name) {
        let after = &tag[from + offset + name.len()..];
        let trimmed = after.trim_start();
        if let Some(value) = trimmed.strip_prefix('=') {
            let value = value.trim_start().trim_start_matches(['"', '\'']);
            let end = value
                .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
                .unwrap_or(value.len());
            if end > 0 {
                return Some(&value[..end]);
            }
        }
        from += offset + name.len();
    }
    None
}
