use std::collections::BTreeMap;
use url::Url;

/// Headers that contain security-sensitive values and must be redacted.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Query parameters that carry credentials or one-time secrets.
pub const SENSITIVE_QUERY_PARAMS: &[&str] = &["client_secret", "code", "access_token", "state"];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    /// Copy headers into a loggable map, redacting sensitive values.
    pub fn sanitize_headers<'a, I>(headers: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        headers
            .into_iter()
            .map(|(key, value)| {
                let value = if Self::is_sensitive_header(key) {
                    REDACTED.to_string()
                } else {
                    value.to_string()
                };
                (key.to_string(), value)
            })
            .collect()
    }

    /// Render a URL for logging.
    ///
    /// The Bot API puts the token in the path (`/bot<token>/method`), and the
    /// OAuth token endpoint takes the client secret as a query parameter; both
    /// are replaced with a marker.
    pub fn sanitize_url(url: &Url) -> String {
        let mut clean = url.clone();

        let path = url
            .path()
            .split('/')
            .map(|segment| {
                if segment.len() > 3 && segment.starts_with("bot") && segment.contains(':') {
                    format!("bot{}", REDACTED)
                } else {
                    segment.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("/");
        clean.set_path(&path);

        if url.query().is_some() {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(key, value)| {
                    let value = if SENSITIVE_QUERY_PARAMS.contains(&key.as_ref()) {
                        REDACTED.to_string()
                    } else {
                        value.into_owned()
                    };
                    (key.into_owned(), value)
                })
                .collect();
            clean.query_pairs_mut().clear().extend_pairs(pairs);
        }

        clean.to_string()
    }
}
