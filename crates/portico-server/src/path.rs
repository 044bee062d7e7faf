//! Service path normalization.

use percent_encoding::percent_decode_str;

use crate::errors::{Result, ServerError};

/// Normalize a service or request path.
///
/// The path is percent-decoded as UTF-8, must be absolute, must not carry a
/// query or fragment, and loses any trailing `/` (the root stays `/`).
pub fn normalize_path(raw: &str) -> Result<String> {
    let invalid = |reason| ServerError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(invalid("must not be empty"));
    }
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| invalid("not valid UTF-8 after percent-decoding"))?;
    if !decoded.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if decoded.contains(['?', '#']) {
        return Err(invalid("must not contain a query or fragment"));
    }

    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn trailing_slash_is_trimmed() {
        assert_eq!(normalize_path("/chat/").unwrap(), "/chat");
        assert_eq!(normalize_path("/chat///").unwrap(), "/chat");
        assert_eq!(normalize_path("/a/b").unwrap(), "/a/b");
    }

    #[test]
    fn root_stays_root() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//").unwrap(), "/");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(normalize_path("/caf%C3%A9").unwrap(), "/café");
        assert_eq!(normalize_path("/a%20b/").unwrap(), "/a b");
    }

    #[test]
    fn relative_paths_rejected() {
        assert_matches!(
            normalize_path("chat"),
            Err(ServerError::InvalidPath { reason, .. }) if reason.contains("start with")
        );
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn query_and_fragment_rejected() {
        assert!(normalize_path("/chat?room=1").is_err());
        assert!(normalize_path("/chat#top").is_err());
        assert!(normalize_path("/chat%3Froom").is_err());
    }

    #[test]
    fn invalid_utf8_rejected() {
        assert_matches!(
            normalize_path("/%FF"),
            Err(ServerError::InvalidPath { reason, .. }) if reason.contains("UTF-8")
        );
    }
}
