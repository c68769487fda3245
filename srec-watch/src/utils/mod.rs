//! Small shared helpers.

use std::sync::OnceLock;

use tracing::debug;

/// Install the rustls crypto provider used by every `reqwest` client.
///
/// reqwest is built with `rustls-tls-webpki-roots-no-provider`, so a
/// provider must be installed before the first client is created.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Characters rejected in file names on at least one supported platform.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Longest name component kept, in characters.
const MAX_COMPONENT_CHARS: usize = 80;

/// Turn a stream title or streamer name into a single file name component.
///
/// Invalid characters and whitespace runs become one `_`, leading and
/// trailing dots/underscores are dropped, and overly long names are cut.
/// Non-ASCII text is kept as is.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_sep = false;

    for c in input.chars() {
        if c.is_control() || c.is_whitespace() || INVALID_CHARS.contains(&c) {
            pending_sep = !out.is_empty();
            continue;
        }
        if pending_sep {
            out.push('_');
            pending_sep = false;
        }
        out.push(c);
    }

    let trimmed: String = out
        .trim_matches(|c| c == '.' || c == '_')
        .chars()
        .take(MAX_COMPONENT_CHARS)
        .collect();

    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize_filename("hello world?"), "hello_world");
        assert_eq!(sanitize_filename("a / b : c"), "a_b_c");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");
    }

    #[test]
    fn test_sanitize_keeps_unicode() {
        assert_eq!(sanitize_filename("观看 一只青蛙"), "观看_一只青蛙");
    }

    #[test]
    fn test_sanitize_empty_and_dots() {
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename("???"), "unnamed");
        assert_eq!(sanitize_filename("..title.."), "title");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_filename(&long).chars().count(), MAX_COMPONENT_CHARS);
    }
}
