//! Origin normalization for frame endpoints.
//!
//! An origin is scheme + host + non-default port.  `file:` URLs collapse to
//! the opaque `file://` origin.  Default ports (80 for http, 443 for https)
//! are stripped.

use url::Url;

/// Normalize a declared source URL to its origin, or `None` when the URL
/// does not parse or has no host.
pub fn normalize_origin(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if url.scheme() == "file" {
        return Some("file://".to_owned());
    }
    let host = url.host_str()?;
    // Url::port() already reports None for a scheme's default port.
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
