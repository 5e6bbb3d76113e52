//! Request gate: decides whether a response may be cached at all.
//!
//! Rules run in a fixed order and the first failing rule wins:
//! safe method, no query parameters, no privileged context or session,
//! no excluded path pattern.

use axum::http::{HeaderMap, Method, Uri, header};

use super::keys::CanonicalUrl;

pub const FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const FORWARDED_HOST: &str = "x-forwarded-host";

/// Path substrings that are never cached.
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &[
    "wp-login.php",
    "wp-admin",
    "wp-cron.php",
    "wp-content",
    "wp-includes",
    "xmlrpc.php",
    "wp-api",
    "/cart/",
    "/checkout/",
    "/my-account/",
    "add-to-cart",
    "logout",
    "lost-password",
    "register",
];

/// Cookie name prefixes that indicate a signed-in or personalised visitor.
pub const DEFAULT_SESSION_COOKIE_PREFIXES: &[&str] =
    &["wordpress_logged_in_", "wp-postpass_", "comment_author_"];

/// Path prefixes that identify the administrative/login surface.
pub const DEFAULT_ADMIN_PATH_PREFIXES: &[&str] = &["/wp-admin", "/wp-login.php"];

/// Static rule set for the gate, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct GateRules {
    /// Substring patterns tested against the raw request path.
    pub excluded_paths: Vec<String>,
    pub session_cookie_prefixes: Vec<String>,
    pub admin_path_prefixes: Vec<String>,
    /// Honour `X-Forwarded-Proto`/`X-Forwarded-Host`. Only safe when every
    /// request arrives through a proxy that overwrites them.
    pub trust_forwarded: bool,
}

impl Default for GateRules {
    fn default() -> Self {
        Self {
            excluded_paths: to_owned(DEFAULT_EXCLUDED_PATHS),
            session_cookie_prefixes: to_owned(DEFAULT_SESSION_COOKIE_PREFIXES),
            admin_path_prefixes: to_owned(DEFAULT_ADMIN_PATH_PREFIXES),
            trust_forwarded: false,
        }
    }
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Everything the gate needs to know about one request.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub host: Option<String>,
    pub secure: bool,
    /// The request targets the administrative or login surface.
    pub privileged: bool,
    /// The visitor carries a session or credentials.
    pub authenticated: bool,
}

impl RequestFacts {
    /// Derive request facts from the method, URI and headers of an inbound request.
    ///
    /// With [`GateRules::trust_forwarded`] set, transport security and host
    /// come from `X-Forwarded-Proto`/`X-Forwarded-Host` so the gate works
    /// behind a TLS terminator. Otherwise those headers are ignored.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap, rules: &GateRules) -> Self {
        let path = uri.path().to_string();
        let forwarded = |name: &str| {
            if rules.trust_forwarded {
                header_str(headers, name)
            } else {
                None
            }
        };
        let secure = forwarded(FORWARDED_PROTO)
            .map(|proto| proto.split(',').next().unwrap_or("").trim().eq_ignore_ascii_case("https"))
            .unwrap_or_else(|| uri.scheme_str() == Some("https"));
        let host = forwarded(FORWARDED_HOST)
            .or_else(|| header_str(headers, header::HOST.as_str()))
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.as_str().to_string()));

        let privileged = rules
            .admin_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()));
        let authenticated = headers.contains_key(header::AUTHORIZATION)
            || has_session_cookie(headers, &rules.session_cookie_prefixes);

        Self {
            method: method.clone(),
            path,
            query: uri.query().map(str::to_string),
            host,
            secure,
            privileged,
            authenticated,
        }
    }

    pub fn has_query(&self) -> bool {
        self.query.as_deref().is_some_and(|q| !q.is_empty())
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// Canonical URL of the request (scheme + host + path, no query).
    pub fn canonical_url(&self) -> Option<CanonicalUrl> {
        let host = self.host.as_deref()?;
        CanonicalUrl::from_parts(self.scheme(), host, &self.path)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn has_session_cookie(headers: &HeaderMap, prefixes: &[String]) -> bool {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.split('=').next())
        .map(str::trim)
        .any(|name| prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())))
}

/// Why a request bypassed the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    Method,
    QueryString,
    Privileged,
    Session,
    ExcludedPath(String),
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Method => "method",
            BypassReason::QueryString => "query_string",
            BypassReason::Privileged => "privileged",
            BypassReason::Session => "session",
            BypassReason::ExcludedPath(_) => "excluded_path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Cacheable,
    Bypass(BypassReason),
}

impl GateDecision {
    pub fn is_cacheable(&self) -> bool {
        matches!(self, GateDecision::Cacheable)
    }
}

/// Evaluate the cacheability rules for one request. Pure and deterministic.
pub fn evaluate(facts: &RequestFacts, rules: &GateRules) -> GateDecision {
    if facts.method != Method::GET {
        return GateDecision::Bypass(BypassReason::Method);
    }

    if facts.has_query() {
        return GateDecision::Bypass(BypassReason::QueryString);
    }

    if facts.privileged {
        return GateDecision::Bypass(BypassReason::Privileged);
    }

    if facts.authenticated {
        return GateDecision::Bypass(BypassReason::Session);
    }

    // Independent of the privileged check above: plain substring containment
    // against the raw path.
    if let Some(pattern) = rules
        .excluded_paths
        .iter()
        .find(|pattern| !pattern.is_empty() && facts.path.contains(pattern.as_str()))
    {
        return GateDecision::Bypass(BypassReason::ExcludedPath(pattern.clone()));
    }

    GateDecision::Cacheable
}
