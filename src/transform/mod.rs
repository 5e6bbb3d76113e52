//! Page transforms applied between capture and persistence.

pub mod css;
pub mod css_minify;
pub mod fetch;
pub mod html;
pub mod js_minify;
pub mod protocol;
pub mod scripts;

pub use css::{CssConfig, CssError, CssOptimizer, DEFAULT_PUBLIC_PATH};
pub use fetch::{FetchError, HttpStylesheetSource, StylesheetSource};
pub use html::{MinifyError, MinifyOptions, minify};
pub use scripts::ScriptLoading;
