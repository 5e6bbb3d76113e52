//! Text-preserving HTML minification.
//!
//! Sensitive regions (conditional comments, `pre`/`textarea`, `script`,
//! `style`) are swapped out for placeholder tokens before any whitespace or
//! comment stripping and swapped back afterwards. Script and style bodies
//! may be compressed on the way back in; the other regions come back
//! byte-for-byte.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::{css_minify::minify_css, js_minify::minify_js};

// Leftmost match wins, so protected regions never nest.
static PROTECTED_REGION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?is)(?P<conditional><!--\[if[^\]]*\]>.*?<!\[endif\]-->)",
        r"|(?P<verbatim><pre\b[^>]*>.*?</pre\s*>|<textarea\b[^>]*>.*?</textarea\s*>)",
        r"|(?P<script><script\b[^>]*>.*?</script\s*>)",
        r"|(?P<style><style\b[^>]*>.*?</style\s*>)",
    ))
    .expect("valid regex")
});

static BLOCK_PARTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\A(<(?:script|style)\b[^>]*>)(.*)(</(?:script|style)\s*>)\z")
        .expect("valid regex")
});
static TYPE_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\stype\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).expect("valid regex")
});

static SPACE_AFTER_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r">[^\S ]+").expect("valid regex"));
static SPACE_BEFORE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S ]+<").expect("valid regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\A[\r\n]*|[\r\n]+)[ \t\f\v]*[\r\n]+").expect("valid regex"));

// Private-use code points; one absent from the input delimits placeholders.
const MARKER_RANGE: std::ops::RangeInclusive<u32> = 0xE000..=0xF8FF;

/// Which transformations a minification pass applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinifyOptions {
    pub remove_comments: bool,
    pub remove_whitespace: bool,
    pub remove_blank_lines: bool,
    pub compress_js: bool,
    pub compress_css: bool,
}

impl Default for MinifyOptions {
    fn default() -> Self {
        Self {
            remove_comments: true,
            remove_whitespace: true,
            remove_blank_lines: true,
            compress_js: true,
            compress_css: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MinifyError {
    #[error("input uses every private-use code point; no placeholder marker is available")]
    MarkerUnavailable,
    #[error("placeholder for {category} segment #{index} was lost during minification")]
    MissingPlaceholder {
        category: &'static str,
        index: usize,
    },
    #[error("unrestored placeholder left in minified output")]
    LeftoverPlaceholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Conditional,
    Verbatim,
    Script,
    Style,
}

impl Category {
    fn of(caps: &regex::Captures<'_>) -> Self {
        if caps.name("conditional").is_some() {
            Category::Conditional
        } else if caps.name("verbatim").is_some() {
            Category::Verbatim
        } else if caps.name("script").is_some() {
            Category::Script
        } else {
            Category::Style
        }
    }

    fn tag(self) -> char {
        match self {
            Category::Conditional => 'C',
            Category::Verbatim => 'P',
            Category::Script => 'S',
            Category::Style => 'T',
        }
    }

    fn label(self) -> &'static str {
        match self {
            Category::Conditional => "conditional comment",
            Category::Verbatim => "pre/textarea",
            Category::Script => "script",
            Category::Style => "style",
        }
    }
}

/// Placeholder bookkeeping for a single minification pass.
struct ProtectedSegments {
    marker: char,
    segments: [Vec<String>; 4],
}

impl ProtectedSegments {
    fn for_input(input: &str) -> Result<Self, MinifyError> {
        let marker = MARKER_RANGE
            .filter_map(char::from_u32)
            .find(|candidate| !input.contains(*candidate))
            .ok_or(MinifyError::MarkerUnavailable)?;
        Ok(Self {
            marker,
            segments: Default::default(),
        })
    }

    fn token(&self, category: Category, index: usize) -> String {
        placeholder(self.marker, category, index)
    }

    /// Replace every protected region with a fresh token, in document order.
    fn extract(&mut self, html: &str) -> String {
        let marker = self.marker;
        let segments = &mut self.segments;
        PROTECTED_REGION
            .replace_all(html, |caps: &regex::Captures<'_>| {
                let category = Category::of(caps);
                let found = &mut segments[category as usize];
                let index = found.len();
                found.push(caps[0].to_string());
                placeholder(marker, category, index)
            })
            .into_owned()
    }

    /// Put every segment of `category` back, exactly once each.
    fn restore(
        &self,
        mut html: String,
        category: Category,
        transform: impl Fn(&str) -> String,
    ) -> Result<String, MinifyError> {
        for (index, segment) in self.segments[category as usize].iter().enumerate() {
            let token = self.token(category, index);
            let Some(at) = html.find(&token) else {
                return Err(MinifyError::MissingPlaceholder {
                    category: category.label(),
                    index,
                });
            };
            html.replace_range(at..at + token.len(), &transform(segment));
        }
        Ok(html)
    }

    fn contains_token(&self, text: &str) -> bool {
        text.contains(self.marker)
    }
}

fn placeholder(marker: char, category: Category, index: usize) -> String {
    format!("{marker}{}{index}{marker}", category.tag())
}

/// Minify an HTML document.
///
/// Empty input is returned as-is. Never leaves a placeholder in the output:
/// any bookkeeping mismatch is reported as an error instead.
pub fn minify(html: &str, options: &MinifyOptions) -> Result<String, MinifyError> {
    if html.is_empty() {
        return Ok(String::new());
    }

    let mut protected = ProtectedSegments::for_input(html)?;
    let mut text = protected.extract(html);

    if options.remove_comments {
        text = strip_comments(&text, |comment| protected.contains_token(comment));
    }

    if options.remove_whitespace {
        text = collapse_whitespace(&text, protected.marker);
    }

    if options.remove_blank_lines {
        text = BLANK_LINES.replace_all(&text, "\n").into_owned();
    }

    let text = protected.restore(text, Category::Conditional, str::to_string)?;
    let text = protected.restore(text, Category::Verbatim, str::to_string)?;
    let text = protected.restore(text, Category::Script, |segment| {
        if options.compress_js && is_javascript_block(segment) {
            compress_block(segment, minify_js)
        } else {
            segment.to_string()
        }
    })?;
    let text = protected.restore(text, Category::Style, |segment| {
        if options.compress_css {
            compress_block(segment, minify_css)
        } else {
            segment.to_string()
        }
    })?;

    if protected.contains_token(&text) {
        return Err(MinifyError::LeftoverPlaceholder);
    }

    Ok(text.trim().to_string())
}

/// Remove ordinary `<!-- -->` comments.
///
/// Comments whose body opens with `[if `, `<!` or `>` are kept, and so are
/// comments that swallowed a placeholder token.
fn strip_comments(html: &str, keep: impl Fn(&str) -> bool) -> String {
    const OPEN: &str = "<!--";
    const CLOSE: &str = "-->";

    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find(OPEN) {
        let body_start = start + OPEN.len();
        let Some(body_len) = rest[body_start..].find(CLOSE) else {
            break;
        };
        let end = body_start + body_len + CLOSE.len();
        let body = &rest[body_start..body_start + body_len];
        let lead = body.trim_start();

        out.push_str(&rest[..start]);
        if lead.starts_with("[if ") || lead.starts_with("<!") || lead.starts_with('>') || keep(body)
        {
            out.push_str(&rest[start..end]);
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn collapse_whitespace(html: &str, marker: char) -> String {
    let text = SPACE_AFTER_TAG.replace_all(html, ">");
    let text = SPACE_BEFORE_TAG.replace_all(&text, "<");
    let text = trim_around_placeholders(&text, marker);
    WHITESPACE_RUN.replace_all(&text, " ").into_owned()
}

/// Placeholders stand in for whole tags, so line breaks touching them go
/// the same way as line breaks touching `<` or `>`.
fn trim_around_placeholders(text: &str, marker: char) -> String {
    let is_break = |c: char| c.is_whitespace() && c != ' ';
    let mut out = String::with_capacity(text.len());
    let mut pending = String::new();
    for c in text.chars() {
        if is_break(c) {
            if !out.ends_with(marker) {
                pending.push(c);
            }
            continue;
        }
        if c != marker {
            out.push_str(&pending);
        }
        pending.clear();
        out.push(c);
    }
    out.push_str(&pending);
    out
}

/// Apply `compress` to the body of a `<script>`/`<style>` block, keeping its tags.
fn compress_block(segment: &str, compress: fn(&str) -> String) -> String {
    match BLOCK_PARTS.captures(segment) {
        Some(caps) => format!("{}{}{}", &caps[1], compress(&caps[2]), &caps[3]),
        None => segment.to_string(),
    }
}

/// True when a script block holds code or JSON rather than an inert template.
fn is_javascript_block(segment: &str) -> bool {
    let Some(open_tag) = BLOCK_PARTS.captures(segment).and_then(|caps| caps.get(1)) else {
        return false;
    };
    let Some(caps) = TYPE_ATTRIBUTE.captures(open_tag.as_str()) else {
        return true;
    };
    let value = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim().to_ascii_lowercase())
        .unwrap_or_default();

    value.is_empty()
        || value == "module"
        || value.contains("javascript")
        || value.contains("ecmascript")
        || value.contains("json")
}
