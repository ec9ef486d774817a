//! URL normalisation helpers.

use url::Url;

/// Normalise a site URL: default the scheme to `https`, lowercase scheme and
/// host, drop the fragment and any trailing slash on the path.
///
/// Returns `None` when the input cannot be parsed even after scheme
/// defaulting.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = parse_lenient(raw)?;
    url.set_fragment(None);
    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);
    let mut out = url.to_string();
    if out.ends_with('/') && url.query().is_none() {
        out.pop();
    }
    Some(out)
}

/// Lowercased host of `raw`, if it has one.
pub fn host_of(raw: &str) -> Option<String> {
    parse_lenient(raw)?.host_str().map(str::to_ascii_lowercase)
}

/// Join `path` onto the origin of `raw` (e.g. `/robots.txt`).
pub fn origin_join(raw: &str, path: &str) -> Option<String> {
    let url = parse_lenient(raw)?;
    url.join(path).ok().map(|u| u.to_string())
}

fn parse_lenient(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        format!("https://{raw}")
    };
    Url::parse(&candidate).ok().filter(|u| u.host_str().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTP://MIT.EDU/page/#section").as_deref(),
            Some("http://mit.edu/page")
        );
    }

    #[test]
    fn normalize_defaults_scheme() {
        assert_eq!(
            normalize_url("example.com/path/").as_deref(),
            Some("https://example.com/path")
        );
        assert_eq!(normalize_url("example.com").as_deref(), Some("https://example.com"));
    }

    #[test]
    fn normalize_keeps_query() {
        assert_eq!(
            normalize_url("https://example.com/a?b=1").as_deref(),
            Some("https://example.com/a?b=1")
        );
    }

    #[test]
    fn host_of_handles_ports_and_case() {
        assert_eq!(host_of("https://Www.Stanford.EDU:8443/x").as_deref(), Some("www.stanford.edu"));
        assert_eq!(host_of(""), None);
    }

    #[test]
    fn origin_join_replaces_path() {
        assert_eq!(
            origin_join("www.berkeley.edu/academics", "/robots.txt").as_deref(),
            Some("https://www.berkeley.edu/robots.txt")
        );
    }
}
