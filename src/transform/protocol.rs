//! Mixed-content fixes for pages served over a secure transport.

use once_cell::sync::Lazy;
use regex::{Captures, Regex, RegexBuilder};

static PROTOCOL_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(src|href)=(["'])//"#).expect("valid regex"));

/// Rewrite insecure same-host references for a page served over HTTPS.
///
/// Absolute `http://<host>` references become `https://<host>`, and
/// protocol-relative `src="//…"`/`href="//…"` attributes become explicit
/// `https://` references. Other hosts' `http://` URLs are left untouched.
pub fn normalize(html: &str, host: &str) -> String {
    let html = match same_host_pattern(host) {
        Some(pattern) => pattern
            .replace_all(html, |caps: &Captures<'_>| {
                format!("https://{host}{}", &caps["next"])
            })
            .into_owned(),
        None => html.to_string(),
    };

    PROTOCOL_RELATIVE
        .replace_all(&html, "${1}=${2}https://")
        .into_owned()
}

/// `http://<host>` followed by something that cannot continue a host name,
/// so `example.com` matches neither `example.com.evil.net` nor `example.com:8443`.
fn same_host_pattern(host: &str) -> Option<Regex> {
    if host.is_empty() {
        return None;
    }
    RegexBuilder::new(&format!(
        r"http://{}(?P<next>[^A-Za-z0-9.:\-]|$)",
        regex::escape(host)
    ))
    .case_insensitive(true)
    .build()
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_same_host_references() {
        let html = r#"<img src="http://example.com/x.png"><a href="HTTP://Example.com/about">"#;
        assert_eq!(
            normalize(html, "example.com"),
            r#"<img src="https://example.com/x.png"><a href="https://example.com/about">"#
        );
    }

    #[test]
    fn leaves_other_hosts_alone() {
        let html = r#"<img src="http://cdn.other.net/x.png"><a href="http://example.com.evil.net/">"#;
        assert_eq!(normalize(html, "example.com"), html);
    }

    #[test]
    fn upgrades_protocol_relative_resources() {
        let html = r#"<script src="//cdn.example.net/a.js"></script><link href='//fonts.example.net/c.css'>"#;
        assert_eq!(
            normalize(html, "example.com"),
            r#"<script src="https://cdn.example.net/a.js"></script><link href='https://fonts.example.net/c.css'>"#
        );
    }

    #[test]
    fn host_with_port_is_matched_literally() {
        let html = r#"<img src="http://localhost:8080/x.png"><img src="http://localhost:80801/y.png">"#;
        assert_eq!(
            normalize(html, "localhost:8080"),
            r#"<img src="https://localhost:8080/x.png"><img src="http://localhost:80801/y.png">"#
        );
    }
}
