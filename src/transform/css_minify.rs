//! CSS text compression and concatenation.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

static URL_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^'"\)\s]+))\s*\)"#).expect("valid regex")
});
static IMPORT_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)@import\s+[^;]+;").expect("valid regex"));
static IMPORT_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\A(@import\s+)(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});
static CHARSET_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)@charset\s+[^;]*;").expect("valid regex"));

/// A space after any of these is redundant.
const TIGHT_AFTER: &[char] = &['{', '}', ';', ':', ',', '>'];
/// A space before any of these is redundant.
const TIGHT_BEFORE: &[char] = &['{', '}', ';', ',', '>'];

/// Compress a stylesheet: drop comments, collapse whitespace, tighten
/// punctuation and drop the last semicolon of each block.
///
/// Quoted strings are copied untouched.
pub fn minify_css(css: &str) -> String {
    let chars: Vec<char> = css.chars().collect();
    let mut out = String::with_capacity(css.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            pending_space = true;
            continue;
        }

        if pending_space {
            pending_space = false;
            if let Some(prev) = out.chars().next_back()
                && !TIGHT_AFTER.contains(&prev)
                && !TIGHT_BEFORE.contains(&c)
            {
                out.push(' ');
            }
        }

        match c {
            '"' | '\'' => {
                out.push(c);
                i += 1;
                while i < chars.len() {
                    let ch = chars[i];
                    out.push(ch);
                    i += 1;
                    if ch == '\\' {
                        if let Some(&escaped) = chars.get(i) {
                            out.push(escaped);
                            i += 1;
                        }
                    } else if ch == c {
                        break;
                    }
                }
            }
            '}' => {
                if out.ends_with(';') {
                    out.pop();
                }
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out.trim().to_string()
}

/// Rewrite relative `url(...)` references against `base`.
///
/// `data:` URIs, fragment-only references and unparsable values are kept.
pub fn rebase_urls(css: &str, base: &Url) -> String {
    URL_REFERENCE
        .replace_all(css, |caps: &Captures<'_>| {
            let (value, quote) = match (caps.get(1), caps.get(2), caps.get(3)) {
                (Some(v), _, _) => (v.as_str(), "\""),
                (_, Some(v), _) => (v.as_str(), "'"),
                (_, _, Some(v)) => (v.as_str(), ""),
                _ => return caps[0].to_string(),
            };
            match resolve_reference(value, base) {
                Some(absolute) => format!("url({quote}{absolute}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn resolve_reference(value: &str, base: &Url) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
    {
        return None;
    }
    base.join(trimmed).ok().map(String::from)
}

/// Accumulates stylesheets into one consolidated file.
///
/// `@charset` rules are dropped and `@import` rules are hoisted to the top in
/// discovery order, since both are only valid at the start of a stylesheet.
#[derive(Debug, Default)]
pub struct CssBundle {
    imports: Vec<String>,
    rules: Vec<String>,
}

impl CssBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one stylesheet, rebasing relative URLs against `base` when given.
    pub fn push(&mut self, css: &str, base: Option<&Url>) {
        let css = CHARSET_RULE.replace_all(css, "");
        let css = match base {
            Some(base) => rebase_urls(&css, base),
            None => css.into_owned(),
        };

        let mut rest = String::with_capacity(css.len());
        let mut last = 0;
        for found in IMPORT_RULE.find_iter(&css) {
            rest.push_str(&css[last..found.start()]);
            self.imports.push(rebase_import(found.as_str(), base));
            last = found.end();
        }
        rest.push_str(&css[last..]);

        let rest = rest.trim();
        if !rest.is_empty() {
            self.rules.push(rest.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.rules.is_empty()
    }

    /// Concatenate everything, minifying when asked.
    pub fn finish(self, minify: bool) -> String {
        let combined = self
            .imports
            .into_iter()
            .chain(self.rules)
            .collect::<Vec<_>>()
            .join("\n");
        if minify {
            minify_css(&combined)
        } else {
            combined
        }
    }
}

/// `@import "x.css";` carries a bare string rather than `url()`.
fn rebase_import(rule: &str, base: Option<&Url>) -> String {
    let Some(base) = base else {
        return rule.to_string();
    };
    IMPORT_STRING
        .replace(rule, |caps: &Captures<'_>| {
            let (value, quote) = match (caps.get(2), caps.get(3)) {
                (Some(v), _) => (v.as_str(), "\""),
                (_, Some(v)) => (v.as_str(), "'"),
                _ => return caps[0].to_string(),
            };
            match resolve_reference(value, base) {
                Some(absolute) => format!("{}{quote}{absolute}{quote}", &caps[1]),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
