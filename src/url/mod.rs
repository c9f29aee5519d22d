//! URL handling for discovered links
//!
//! Links found in documents are usually relative to the page they were found on.
//! This module resolves them to absolute URLs and recognizes file-like keys.

use crate::rule::is_file_extension;
use url::Url;

/// Resolves a possibly relative link against the URL of the page it was found on
///
/// | link | base | result |
/// |------|------|--------|
/// | `./bar` | `https://abc.com/foo/bar.html` | `https://abc.com/foo/bar` |
/// | `/bar` | `https://abc.com/foo/bar.html` | `https://abc.com/bar` |
/// | `//host/bar` | `https://abc.com/foo/bar.html` | `https://host/bar` |
/// | `https://x.org/` | anything | `https://x.org/` |
///
/// Links that cannot be resolved are returned unchanged.
///
/// # Arguments
///
/// * `link` - The link as written in the document
/// * `base` - The URL of the containing document
pub fn resolve_url(link: &str, base: &str) -> String {
    let link = link.trim();

    if Url::parse(link).is_ok() {
        return link.to_string();
    }

    let base_url = match Url::parse(base) {
        Ok(url) => url,
        Err(_) => return link.to_string(),
    };

    // Protocol-relative links take the scheme of the containing page
    if link.starts_with("//") {
        return format!("{}:{}", base_url.scheme(), link);
    }

    match base_url.join(link) {
        Ok(url) => url.to_string(),
        Err(_) => link.to_string(),
    }
}

/// Returns the recognized file extension of a data-field key such as `cover.webp`
pub fn file_extension(key: &str) -> Option<String> {
    let (stem, ext) = key.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains('/') {
        return None;
    }

    let ext = ext.to_ascii_lowercase();
    is_file_extension(&ext).then_some(ext)
}
