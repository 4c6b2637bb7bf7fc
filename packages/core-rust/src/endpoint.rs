//! HTTP endpoint descriptors and their path-matching rules.
//!
//! Two trigger styles exist:
//!
//! - **Balancer** endpoints use `*` wildcards anywhere in a path, compiled to
//!   `^path$` with each `*` replaced by `.*`. Predicates are header conditions
//!   (`{name, values}`) and query condition groups.
//! - **Gateway** endpoints use `{name}` / `{name+}` placeholders. A literal `*`
//!   has no special meaning except for the catch-all paths `*` and `/*`.
//!   Without a greedy placeholder, a request must have the same number of
//!   path segments as the pattern. Version 1 (REST style) gateways tolerate
//!   one trailing slash. Predicates are required header / query names.
//!
//! Descriptors are compiled once from [`EndpointConfig`] at registration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Multi-valued, lowercase-keyed map used for request headers and query.
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// Errors raised while compiling an endpoint declaration.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint declares no paths")]
    NoPaths,
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("invalid path pattern: {0}")]
    Regex(#[from] regex::Error),
}

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    /// Wildcard accepted by descriptors; never produced by a request.
    Any,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Any => "ANY",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "ANY" | "*" => Ok(Self::Any),
            _ => Err(EndpointError::InvalidMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = EndpointError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(value: HttpMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Declarations (manifest form)
// ---------------------------------------------------------------------------

/// A balancer header condition: the header must carry one of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderCondition {
    pub name: String,
    pub values: Vec<String>,
}

/// A balancer query condition. Without a key, `value` is compared with the
/// whole raw query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCondition {
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerConfig {
    pub paths: Vec<String>,
    #[serde(default)]
    pub methods: Vec<HttpMethod>,
    /// AND across conditions.
    #[serde(default)]
    pub headers: Vec<HeaderCondition>,
    /// AND across groups, OR within a group.
    #[serde(default)]
    pub query: Vec<Vec<QueryCondition>>,
    #[serde(default)]
    pub multi_value_headers: bool,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub paths: Vec<String>,
    #[serde(default)]
    pub methods: Vec<HttpMethod>,
    /// Payload format: 1 for REST-style, 2 for HTTP-API style.
    #[serde(default = "default_gateway_version")]
    pub version: u8,
    /// Header names that must be present.
    #[serde(default)]
    pub headers: Vec<String>,
    /// Query parameter names that must be present.
    #[serde(default)]
    pub querystrings: Vec<String>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

fn default_gateway_version() -> u8 {
    1
}

/// Endpoint declaration as written in a function manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EndpointConfig {
    #[serde(alias = "alb")]
    Balancer(BalancerConfig),
    #[serde(alias = "apg")]
    Gateway(GatewayConfig),
}

// ---------------------------------------------------------------------------
// Compiled descriptor
// ---------------------------------------------------------------------------

/// Trigger style discriminant, used for kind hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointStyle {
    Gateway,
    Balancer,
}

impl EndpointStyle {
    /// Parses a routing hint: `alb`/`balancer` or `apg`/`gateway`.
    #[must_use]
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.to_ascii_lowercase().as_str() {
            "alb" | "balancer" => Some(Self::Balancer),
            "apg" | "gateway" => Some(Self::Gateway),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EndpointKind {
    Gateway {
        version: u8,
        required_headers: Vec<String>,
        required_query: Vec<String>,
    },
    Balancer {
        header_conditions: Vec<HeaderCondition>,
        query_groups: Vec<Vec<QueryCondition>>,
        multi_value_headers: bool,
    },
}

#[derive(Debug, Clone)]
struct PathPattern {
    regex: Regex,
    /// Placeholder names in capture-group order; `true` marks a greedy one.
    params: Vec<(String, bool)>,
    /// `None` when the pattern may span any number of segments.
    segments: Option<usize>,
}

/// The request attributes routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub method: HttpMethod,
    pub path: &'a str,
    /// Header names are expected lowercase.
    pub headers: &'a MultiMap,
    pub query: &'a MultiMap,
    pub raw_query: &'a str,
}

/// A compiled, immutable endpoint descriptor.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    kind: EndpointKind,
    paths: Vec<String>,
    methods: Vec<HttpMethod>,
    is_async: bool,
    patterns: Vec<PathPattern>,
}

impl EndpointDescriptor {
    /// Compiles a manifest declaration.
    ///
    /// # Errors
    ///
    /// Returns an error when the declaration has no paths, a gateway path is
    /// malformed, or a pattern fails to compile.
    pub fn compile(config: EndpointConfig) -> Result<Self, EndpointError> {
        match config {
            EndpointConfig::Balancer(c) => {
                let paths = normalize_paths(c.paths)?;
                let patterns = paths
                    .iter()
                    .map(|p| compile_balancer(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self {
                    kind: EndpointKind::Balancer {
                        header_conditions: c.headers,
                        query_groups: c.query,
                        multi_value_headers: c.multi_value_headers,
                    },
                    paths,
                    methods: default_methods(c.methods),
                    is_async: c.is_async,
                    patterns,
                })
            }
            EndpointConfig::Gateway(c) => {
                let mut paths = normalize_paths(c.paths)?;
                let rest_style = c.version < 2;
                for path in &mut paths {
                    if path.len() > 1 && path.ends_with('/') {
                        if !rest_style {
                            return Err(EndpointError::InvalidPath {
                                path: path.clone(),
                                reason: "HTTP API routes must not end with '/'",
                            });
                        }
                        path.pop();
                    }
                }
                let patterns = paths
                    .iter()
                    .map(|p| compile_gateway(p, rest_style))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self {
                    kind: EndpointKind::Gateway {
                        version: c.version,
                        required_headers: lowercase_all(c.headers),
                        required_query: c.querystrings,
                    },
                    paths,
                    methods: default_methods(c.methods),
                    is_async: c.is_async,
                    patterns,
                })
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    #[must_use]
    pub fn style(&self) -> EndpointStyle {
        match self.kind {
            EndpointKind::Gateway { .. } => EndpointStyle::Gateway,
            EndpointKind::Balancer { .. } => EndpointStyle::Balancer,
        }
    }

    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    #[must_use]
    pub fn methods(&self) -> &[HttpMethod] {
        &self.methods
    }

    /// Endpoint answers immediately and runs the function asynchronously.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    #[must_use]
    pub fn accepts_method(&self, method: HttpMethod) -> bool {
        self.methods
            .iter()
            .any(|m| *m == HttpMethod::Any || *m == method)
    }

    /// Exact pass: a declared path equals the request path literally.
    #[must_use]
    pub fn matches_exact(&self, req: &RouteRequest<'_>) -> bool {
        self.paths.iter().any(|p| p == req.path)
            && self.accepts_method(req.method)
            && self.predicates_hold(req)
    }

    /// Pattern pass: wildcards and placeholders are expanded.
    #[must_use]
    pub fn matches_pattern(&self, req: &RouteRequest<'_>) -> bool {
        self.matching_pattern(req.path).is_some()
            && self.accepts_method(req.method)
            && self.predicates_hold(req)
    }

    /// Returns the declared path that matches `path`, exact matches first.
    #[must_use]
    pub fn resource_for(&self, path: &str) -> Option<&str> {
        if let Some(exact) = self.paths.iter().find(|p| *p == path) {
            return Some(exact);
        }
        self.matching_pattern(path).map(|i| self.paths[i].as_str())
    }

    /// Extracts gateway placeholder values. Greedy placeholders capture the
    /// remaining path without its leading slash.
    #[must_use]
    pub fn path_parameters(&self, path: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let Some(index) = self.matching_pattern(path) else {
            return params;
        };
        let pattern = &self.patterns[index];
        if let Some(caps) = pattern.regex.captures(path) {
            for (i, (name, _greedy)) in pattern.params.iter().enumerate() {
                if let Some(m) = caps.get(i + 1) {
                    params.insert(name.clone(), m.as_str().to_string());
                }
            }
        }
        params
    }

    fn matching_pattern(&self, path: &str) -> Option<usize> {
        let request_segments = segment_count(path);
        self.patterns.iter().position(|p| {
            p.regex.is_match(path) && p.segments.is_none_or(|n| n == request_segments)
        })
    }

    fn predicates_hold(&self, req: &RouteRequest<'_>) -> bool {
        match &self.kind {
            EndpointKind::Gateway {
                required_headers,
                required_query,
                ..
            } => {
                required_headers.iter().all(|h| req.headers.contains_key(h))
                    && required_query.iter().all(|q| req.query.contains_key(q))
            }
            EndpointKind::Balancer {
                header_conditions,
                query_groups,
                ..
            } => {
                header_conditions.iter().all(|c| header_condition_holds(c, req))
                    && query_groups.iter().all(|g| query_group_holds(g, req))
            }
        }
    }
}

fn header_condition_holds(condition: &HeaderCondition, req: &RouteRequest<'_>) -> bool {
    req.headers
        .get(&condition.name.to_ascii_lowercase())
        .is_some_and(|actual| condition.values.iter().any(|v| actual.contains(v)))
}

fn query_group_holds(group: &[QueryCondition], req: &RouteRequest<'_>) -> bool {
    group.iter().any(|c| match &c.key {
        Some(key) => req
            .query
            .get(key)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(&c.value))),
        None => req.raw_query.eq_ignore_ascii_case(&c.value),
    })
}

fn normalize_paths(paths: Vec<String>) -> Result<Vec<String>, EndpointError> {
    if paths.is_empty() {
        return Err(EndpointError::NoPaths);
    }
    Ok(paths
        .into_iter()
        .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
        .collect())
}

fn default_methods(methods: Vec<HttpMethod>) -> Vec<HttpMethod> {
    if methods.is_empty() {
        vec![HttpMethod::Any]
    } else {
        methods
    }
}

fn lowercase_all(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.to_ascii_lowercase()).collect()
}

fn segment_count(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

fn compile_balancer(path: &str) -> Result<PathPattern, EndpointError> {
    let body = path
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Ok(PathPattern {
        regex: Regex::new(&format!("^{body}$"))?,
        params: Vec::new(),
        segments: None,
    })
}

fn compile_gateway(path: &str, rest_style: bool) -> Result<PathPattern, EndpointError> {
    if path == "/*" {
        return Ok(PathPattern {
            regex: Regex::new("^.*$")?,
            params: Vec::new(),
            segments: None,
        });
    }

    let mut body = String::new();
    let mut params = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        body.push('/');
        match placeholder(segment) {
            Some((name, greedy)) => {
                body.push_str("(.*)");
                params.push((name.to_string(), greedy));
            }
            None if segment.contains(['{', '}']) => {
                return Err(EndpointError::InvalidPath {
                    path: path.to_string(),
                    reason: "placeholders must span a whole segment",
                });
            }
            None => body.push_str(&regex::escape(segment)),
        }
    }
    if body.is_empty() {
        body.push('/');
    } else if rest_style {
        body.push_str("/?");
    }

    let greedy = params.iter().any(|(_, g)| *g);
    Ok(PathPattern {
        regex: Regex::new(&format!("^{body}$"))?,
        segments: (!greedy).then(|| segment_count(path)),
        params,
    })
}

/// Parses `{name}` or `{name+}`.
fn placeholder(segment: &str) -> Option<(&str, bool)> {
    let inner = segment.strip_prefix('{')?.strip_suffix('}')?;
    let (name, greedy) = match inner.strip_suffix('+') {
        Some(name) => (name, true),
        None => (inner, false),
    };
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    valid.then_some((name, greedy))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(paths: &[&str]) -> EndpointDescriptor {
        EndpointDescriptor::compile(EndpointConfig::Balancer(BalancerConfig {
            paths: paths.iter().map(ToString::to_string).collect(),
            methods: vec![HttpMethod::Get],
            headers: Vec::new(),
            query: Vec::new(),
            multi_value_headers: false,
            is_async: false,
        }))
        .unwrap()
    }

    fn gateway(path: &str, version: u8) -> EndpointDescriptor {
        EndpointDescriptor::compile(EndpointConfig::Gateway(GatewayConfig {
            paths: vec![path.to_string()],
            methods: Vec::new(),
            version,
            headers: Vec::new(),
            querystrings: Vec::new(),
            is_async: false,
        }))
        .unwrap()
    }

    fn get<'a>(path: &'a str, empty: &'a MultiMap) -> RouteRequest<'a> {
        RouteRequest {
            method: HttpMethod::Get,
            path,
            headers: empty,
            query: empty,
            raw_query: "",
        }
    }

    #[test]
    fn balancer_wildcard_spans_segments() {
        let empty = MultiMap::new();
        let d = balancer(&["/users/*"]);
        assert!(d.matches_pattern(&get("/users/42/profile", &empty)));
        assert!(!d.matches_exact(&get("/users/42/profile", &empty)));
        assert!(!d.matches_pattern(&get("/accounts/42", &empty)));
    }

    #[test]
    fn gateway_star_is_literal() {
        let empty = MultiMap::new();
        let d = gateway("/users/*", 2);
        assert!(!d.matches_pattern(&get("/users/42/profile", &empty)));
        assert!(d.matches_exact(&get("/users/*", &empty)));
    }

    #[test]
    fn gateway_catch_all() {
        let empty = MultiMap::new();
        let d = gateway("*", 2);
        assert!(d.matches_pattern(&get("/anything/at/all", &empty)));
    }

    #[test]
    fn gateway_placeholder_respects_segment_count() {
        let empty = MultiMap::new();
        let d = gateway("/users/{id}", 2);
        assert!(d.matches_pattern(&get("/users/42", &empty)));
        assert!(!d.matches_pattern(&get("/users/42/profile", &empty)));
        assert_eq!(
            d.path_parameters("/users/42").get("id").map(String::as_str),
            Some("42")
        );
    }

    #[test]
    fn gateway_greedy_placeholder() {
        let empty = MultiMap::new();
        let d = gateway("/files/{proxy+}", 2);
        assert!(d.matches_pattern(&get("/files/a/b/c.txt", &empty)));
        assert_eq!(
            d.path_parameters("/files/a/b/c.txt").get("proxy").map(String::as_str),
            Some("a/b/c.txt")
        );
    }

    #[test]
    fn rest_gateway_tolerates_trailing_slash() {
        let empty = MultiMap::new();
        let v1 = gateway("/orders/", 1);
        assert_eq!(v1.paths(), ["/orders".to_string()]);
        assert!(v1.matches_pattern(&get("/orders/", &empty)));
        assert!(v1.matches_exact(&get("/orders", &empty)));

        let v2 = gateway("/orders", 2);
        assert!(!v2.matches_pattern(&get("/orders/", &empty)));
    }

    #[test]
    fn http_api_route_with_trailing_slash_is_rejected() {
        let err = EndpointDescriptor::compile(EndpointConfig::Gateway(GatewayConfig {
            paths: vec!["/orders/".into()],
            methods: Vec::new(),
            version: 2,
            headers: Vec::new(),
            querystrings: Vec::new(),
            is_async: false,
        }))
        .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidPath { .. }));
    }

    #[test]
    fn method_filter() {
        let empty = MultiMap::new();
        let d = balancer(&["/users"]);
        let mut req = get("/users", &empty);
        assert!(d.matches_exact(&req));
        req.method = HttpMethod::Post;
        assert!(!d.matches_exact(&req));
        assert!(gateway("/users", 2).accepts_method(HttpMethod::Delete));
    }

    #[test]
    fn balancer_header_conditions() {
        let d = EndpointDescriptor::compile(EndpointConfig::Balancer(BalancerConfig {
            paths: vec!["/tenant".into()],
            methods: Vec::new(),
            headers: vec![HeaderCondition {
                name: "X-Tenant".into(),
                values: vec!["a".into(), "b".into()],
            }],
            query: Vec::new(),
            multi_value_headers: false,
            is_async: false,
        }))
        .unwrap();
        let empty = MultiMap::new();
        let mut headers = MultiMap::new();
        headers.insert("x-tenant".into(), vec!["b".into()]);
        let mut req = get("/tenant", &empty);
        assert!(!d.matches_exact(&req));
        req.headers = &headers;
        assert!(d.matches_exact(&req));
    }

    #[test]
    fn balancer_query_groups() {
        let d = EndpointDescriptor::compile(EndpointConfig::Balancer(BalancerConfig {
            paths: vec!["/search".into()],
            methods: Vec::new(),
            headers: Vec::new(),
            query: vec![
                vec![QueryCondition {
                    key: Some("lang".into()),
                    value: "EN".into(),
                }],
                vec![
                    QueryCondition {
                        key: Some("page".into()),
                        value: "1".into(),
                    },
                    QueryCondition {
                        key: Some("page".into()),
                        value: "2".into(),
                    },
                ],
            ],
            multi_value_headers: false,
            is_async: false,
        }))
        .unwrap();
        let empty = MultiMap::new();
        let mut query = MultiMap::new();
        query.insert("lang".into(), vec!["en".into()]);
        query.insert("page".into(), vec!["2".into()]);
        let req = RouteRequest {
            method: HttpMethod::Get,
            path: "/search",
            headers: &empty,
            query: &query,
            raw_query: "lang=en&page=2",
        };
        assert!(d.matches_exact(&req));

        let mut wrong_page = query.clone();
        wrong_page.insert("page".into(), vec!["3".into()]);
        assert!(!d.matches_exact(&RouteRequest {
            query: &wrong_page,
            raw_query: "lang=en&page=3",
            ..req
        }));
    }

    #[test]
    fn gateway_required_names() {
        let d = EndpointDescriptor::compile(EndpointConfig::Gateway(GatewayConfig {
            paths: vec!["/secure".into()],
            methods: Vec::new(),
            version: 1,
            headers: vec!["X-Api-Key".into()],
            querystrings: vec!["token".into()],
            is_async: false,
        }))
        .unwrap();
        let empty = MultiMap::new();
        let mut headers = MultiMap::new();
        headers.insert("x-api-key".into(), vec!["k".into()]);
        let mut query = MultiMap::new();
        query.insert("token".into(), vec!["t".into()]);
        let req = RouteRequest {
            method: HttpMethod::Get,
            path: "/secure",
            headers: &headers,
            query: &empty,
            raw_query: "",
        };
        assert!(!d.matches_exact(&req));
        assert!(d.matches_exact(&RouteRequest { query: &query, ..req }));
    }

    #[test]
    fn manifest_form_deserializes_with_aliases() {
        let config: EndpointConfig = serde_json::from_value(serde_json::json!({
            "kind": "apg",
            "paths": ["/users/{id}"],
            "methods": ["get", "*"],
            "version": 2
        }))
        .unwrap();
        let d = EndpointDescriptor::compile(config).unwrap();
        assert_eq!(d.style(), EndpointStyle::Gateway);
        assert_eq!(d.methods(), [HttpMethod::Get, HttpMethod::Any]);
    }

    #[test]
    fn placeholder_must_be_whole_segment() {
        let err = EndpointDescriptor::compile(EndpointConfig::Gateway(GatewayConfig {
            paths: vec!["/users/id-{id}".into()],
            methods: Vec::new(),
            version: 2,
            headers: Vec::new(),
            querystrings: Vec::new(),
            is_async: false,
        }))
        .unwrap_err();
        assert!(matches!(err, EndpointError::InvalidPath { .. }));
    }
}
