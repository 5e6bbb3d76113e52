//! Conservative inline-script compression.
//!
//! A single forward scan: string and template literals are copied untouched,
//! comments are dropped, and whitespace runs shrink to one space or one
//! newline. Newlines are kept wherever they could end a statement, so code
//! relying on automatic semicolon insertion keeps working.

/// Characters that make a surrounding space redundant.
const TIGHT_PUNCTUATION: &[char] = &[';', '{', '}', ',', '(', ')'];
/// A newline after one of these never terminates a statement.
const NEWLINE_AFTER: &[char] = &[';', '{', ',', '('];
/// A newline before one of these never terminates a statement.
const NEWLINE_BEFORE: &[char] = &[';', ',', ')', '}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gap {
    Space,
    Newline,
}

impl Gap {
    fn widen(current: Option<Gap>, newline: bool) -> Option<Gap> {
        match (current, newline) {
            (Some(Gap::Newline), _) | (_, true) => Some(Gap::Newline),
            _ => Some(Gap::Space),
        }
    }
}

pub fn minify_js(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut gap: Option<Gap> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            gap = Gap::widen(gap, c == '\n' || c == '\r');
            i += 1;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'*') {
            // Without a terminator this is not a comment (e.g. `/\/*$/`).
            let Some(end) = find_block_comment_end(&chars, i + 2) else {
                flush_gap(&mut out, gap.take(), c);
                out.push_str("/*");
                i += 2;
                continue;
            };
            let newline = chars[i..end].iter().any(|&ch| ch == '\n');
            gap = Gap::widen(gap, newline);
            i = end;
            continue;
        }

        if c == '/' && chars.get(i + 1) == Some(&'/') && !follows_url_scheme(&chars, i) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            gap = Gap::widen(gap, false);
            continue;
        }

        flush_gap(&mut out, gap.take(), c);

        match c {
            '\'' | '"' => i = copy_string(&chars, i, &mut out, c, false),
            '`' => i = copy_string(&chars, i, &mut out, c, true),
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// `//` right after `:` or `\` is part of a URL or escape, not a comment.
fn follows_url_scheme(chars: &[char], at: usize) -> bool {
    at > 0 && matches!(chars[at - 1], ':' | '\\')
}

fn find_block_comment_end(chars: &[char], from: usize) -> Option<usize> {
    let mut j = from;
    while j + 1 < chars.len() {
        if chars[j] == '*' && chars[j + 1] == '/' {
            return Some(j + 2);
        }
        j += 1;
    }
    None
}

fn flush_gap(out: &mut String, gap: Option<Gap>, next: char) {
    let Some(gap) = gap else {
        return;
    };
    let Some(prev) = out.chars().next_back() else {
        return;
    };

    match gap {
        Gap::Newline => {
            if !NEWLINE_AFTER.contains(&prev) && !NEWLINE_BEFORE.contains(&next) {
                out.push('\n');
            }
        }
        Gap::Space => {
            if !TIGHT_PUNCTUATION.contains(&prev) && !TIGHT_PUNCTUATION.contains(&next) {
                out.push(' ');
            }
        }
    }
}

/// Copy a quoted literal starting at `start`; returns the index after it.
///
/// Quote strings stop at an unescaped newline (unterminated literal);
/// template literals may span lines.
fn copy_string(chars: &[char], start: usize, out: &mut String, quote: char, multiline: bool) -> usize {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            out.push(c);
            if let Some(&escaped) = chars.get(i + 1) {
                out.push(escaped);
            }
            i += 2;
            continue;
        }
        if c == '\n' && !multiline {
            return i;
        }
        out.push(c);
        i += 1;
        if c == quote {
            return i;
        }
    }
    i
}
