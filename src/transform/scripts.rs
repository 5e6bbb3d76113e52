//! Script loading rewrite: `defer` for selected scripts, delayed activation
//! for the rest.

use lol_html::{RewriteStrSettings, element, rewrite_str};

/// `type` given to scripts whose execution is postponed until the host's
/// loader activates them.
pub const DELAYED_SCRIPT_TYPE: &str = "presscache/delayed";
/// Attribute that carries the original `src` of a delayed script.
pub const DELAYED_SRC_ATTRIBUTE: &str = "data-presscache-src";

/// Default identifiers of scripts that receive `defer`.
pub const DEFAULT_DEFERRED_SCRIPTS: &[&str] = &["jquery-core", "jquery-migrate"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLoading {
    pub defer: bool,
    pub delay: bool,
    /// Substrings of `src` that are never touched.
    pub excluded: Vec<String>,
    /// Substrings of `src` or `id` that receive `defer`.
    pub deferred: Vec<String>,
}

impl Default for ScriptLoading {
    fn default() -> Self {
        Self {
            defer: false,
            delay: false,
            excluded: Vec::new(),
            deferred: DEFAULT_DEFERRED_SCRIPTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ScriptLoading {
    pub fn is_active(&self) -> bool {
        self.defer || self.delay
    }

    fn is_excluded(&self, src: &str) -> bool {
        matches_any(&self.excluded, src)
    }

    fn is_deferred(&self, src: &str, id: &str) -> bool {
        matches_any(&self.deferred, src) || matches_any(&self.deferred, id)
    }

    /// Rewrite external `<script>` tags according to the configured policy.
    pub fn rewrite(&self, html: &str) -> Result<String, lol_html::errors::RewritingError> {
        if !self.is_active() {
            return Ok(html.to_string());
        }

        rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![element!("script[src]", |el| {
                    let src = el.get_attribute("src").unwrap_or_default();
                    let id = el.get_attribute("id").unwrap_or_default();
                    if self.is_excluded(&src) {
                        return Ok(());
                    }

                    if self.is_deferred(&src, &id) {
                        if self.defer && !el.has_attribute("defer") {
                            el.set_attribute("defer", "")?;
                        }
                        return Ok(());
                    }

                    if self.delay {
                        el.set_attribute("type", DELAYED_SCRIPT_TYPE)?;
                        el.remove_attribute("src");
                        el.set_attribute(DELAYED_SRC_ATTRIBUTE, &src)?;
                    }
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        )
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    !value.is_empty()
        && patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && value.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = concat!(
        r#"<script src="/wp-includes/js/jquery/jquery.min.js" id="jquery-core-js"></script>"#,
        r#"<script src="/app.js"></script>"#,
        r#"<script src="/analytics.js"></script>"#,
        r#"<script>inline()</script>"#,
    );

    #[test]
    fn inactive_policy_is_a_no_op() {
        let out = ScriptLoading::default().rewrite(PAGE).expect("rewrite");
        assert_eq!(out, PAGE);
    }

    #[test]
    fn defer_marks_listed_scripts_only() {
        let policy = ScriptLoading {
            defer: true,
            ..ScriptLoading::default()
        };
        let out = policy.rewrite(PAGE).expect("rewrite");
        assert!(out.contains(
            r#"<script src="/wp-includes/js/jquery/jquery.min.js" id="jquery-core-js" defer=""></script>"#
        ));
        assert!(out.contains(r#"<script src="/app.js"></script>"#));
    }

    #[test]
    fn delay_moves_src_of_other_scripts() {
        let policy = ScriptLoading {
            delay: true,
            excluded: vec!["analytics".to_string()],
            ..ScriptLoading::default()
        };
        let out = policy.rewrite(PAGE).expect("rewrite");
        assert!(out.contains(
            r#"<script type="presscache/delayed" data-presscache-src="/app.js"></script>"#
        ));
        assert!(out.contains(r#"<script src="/analytics.js"></script>"#));
        assert!(out.contains(r#"id="jquery-core-js"></script>"#));
        assert!(out.contains("<script>inline()</script>"));
    }
}
