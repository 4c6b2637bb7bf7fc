//! Function table and HTTP route resolution.
//!
//! The registry is owned by the [`Emulator`](crate::Emulator) and shared by
//! reference with the request server and the delivery sinks. Writes happen
//! at registration time only; dispatch takes the read lock.

use std::sync::Arc;

use localfaas_core::{EndpointDescriptor, EndpointStyle, ManifestError, RouteRequest};
use parking_lot::RwLock;

use crate::invoker::FunctionInvoker;

/// A registered function with its compiled HTTP endpoints.
pub struct RegisteredFunction {
    pub invoker: Arc<FunctionInvoker>,
    pub descriptors: Vec<EndpointDescriptor>,
}

/// Result of a successful route lookup.
#[derive(Clone)]
pub struct RouteMatch {
    pub invoker: Arc<FunctionInvoker>,
    pub descriptor: EndpointDescriptor,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("function", &self.invoker.name())
            .field("paths", &self.descriptor.paths())
            .finish()
    }
}

#[derive(Default)]
pub struct EndpointRegistry {
    functions: RwLock<Vec<Arc<RegisteredFunction>>>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, replacing any earlier registration with the
    /// same name at its original position.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the function's endpoints fails to compile;
    /// the registry is left unchanged.
    pub fn register(&self, invoker: Arc<FunctionInvoker>) -> Result<(), ManifestError> {
        let descriptors = invoker.definition().compile_endpoints()?;
        let entry = Arc::new(RegisteredFunction { invoker, descriptors });

        let mut functions = self.functions.write();
        let name = entry.invoker.name();
        if let Some(slot) = functions.iter_mut().find(|f| f.invoker.name() == name) {
            tracing::info!(function = %name, "replacing registered function");
            *slot = entry;
        } else {
            tracing::debug!(function = %name, endpoints = entry.descriptors.len(), "registered function");
            functions.push(entry);
        }
        Ok(())
    }

    /// Resolves an HTTP request to a function.
    ///
    /// Exact path matches across all functions win over pattern matches.
    /// Within a pass, the first descriptor in registration order wins. A
    /// `hint` restricts the search to one endpoint style.
    #[must_use]
    pub fn route(&self, req: &RouteRequest<'_>, hint: Option<EndpointStyle>) -> Option<RouteMatch> {
        let functions = self.functions.read();
        let candidates = || {
            functions.iter().flat_map(|f| {
                f.descriptors
                    .iter()
                    .filter(move |d| hint.is_none_or(|h| d.style() == h))
                    .map(move |d| (f, d))
            })
        };

        candidates()
            .find(|(_, d)| d.matches_exact(req))
            .or_else(|| candidates().find(|(_, d)| d.matches_pattern(req)))
            .map(|(f, d)| RouteMatch {
                invoker: Arc::clone(&f.invoker),
                descriptor: d.clone(),
            })
    }

    /// Looks a function up by name, output name, ARN, or `name:qualifier`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<FunctionInvoker>> {
        let name = bare_function_name(name);
        self.functions
            .read()
            .iter()
            .find(|f| f.invoker.name() == name || f.invoker.definition().output_name() == name)
            .map(|f| Arc::clone(&f.invoker))
    }

    /// All invokers in registration order.
    #[must_use]
    pub fn invokers(&self) -> Vec<Arc<FunctionInvoker>> {
        self.functions.read().iter().map(|f| Arc::clone(&f.invoker)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

/// Strips an ARN prefix (`arn:aws:lambda:REGION:ACCOUNT:function:`) and a
/// trailing `:qualifier`.
fn bare_function_name(name: &str) -> &str {
    let name = match name.find(":function:") {
        Some(i) if name.starts_with("arn:") => &name[i + ":function:".len()..],
        _ => name,
    };
    name.split(':').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use localfaas_core::{EndpointConfig, HttpMethod, MultiMap};
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::config::EmulatorConfig;
    use crate::invocation::testing::definition;

    fn invoker(name: &str, endpoints: &[serde_json::Value]) -> Arc<FunctionInvoker> {
        let mut def = definition(name);
        def.endpoints = endpoints
            .iter()
            .map(|e| serde_json::from_value::<EndpointConfig>(e.clone()).unwrap())
            .collect();
        FunctionInvoker::new(def, Arc::new(EmulatorConfig::default()), None)
    }

    fn route<'a>(registry: &EndpointRegistry, method: HttpMethod, path: &'a str, headers: &'a MultiMap) -> Option<String> {
        let query = BTreeMap::new();
        let req = RouteRequest {
            method,
            path,
            headers,
            query: &query,
            raw_query: "",
        };
        registry.route(&req, None).map(|m| m.invoker.name().to_string())
    }

    #[test]
    fn exact_path_beats_earlier_pattern() {
        let registry = EndpointRegistry::new();
        registry
            .register(invoker("wild", &[json!({ "kind": "balancer", "paths": ["/users/*"] })]))
            .unwrap();
        registry
            .register(invoker("exact", &[json!({ "kind": "balancer", "paths": ["/users/me"] })]))
            .unwrap();

        let headers = MultiMap::new();
        assert_eq!(route(&registry, HttpMethod::Get, "/users/me", &headers).as_deref(), Some("exact"));
        assert_eq!(route(&registry, HttpMethod::Get, "/users/42", &headers).as_deref(), Some("wild"));
    }

    #[test]
    fn star_is_literal_for_gateway_endpoints() {
        let registry = EndpointRegistry::new();
        registry
            .register(invoker("gw", &[json!({ "kind": "gateway", "paths": ["/users/*"] })]))
            .unwrap();
        let headers = MultiMap::new();
        assert_eq!(route(&registry, HttpMethod::Get, "/users/42/profile", &headers), None);

        registry
            .register(invoker("alb", &[json!({ "kind": "balancer", "paths": ["/users/*"] })]))
            .unwrap();
        assert_eq!(
            route(&registry, HttpMethod::Get, "/users/42/profile", &headers).as_deref(),
            Some("alb")
        );
    }

    #[test]
    fn method_and_predicates_filter_candidates() {
        let registry = EndpointRegistry::new();
        registry
            .register(invoker(
                "admin",
                &[json!({
                    "kind": "balancer",
                    "paths": ["/api/*"],
                    "methods": ["POST"],
                    "headers": [{ "name": "X-Role", "values": ["admin", "root"] }]
                })],
            ))
            .unwrap();
        registry
            .register(invoker("public", &[json!({ "kind": "balancer", "paths": ["/api/*"] })]))
            .unwrap();

        let mut headers = MultiMap::new();
        assert_eq!(route(&registry, HttpMethod::Post, "/api/x", &headers).as_deref(), Some("public"));
        headers.insert("x-role".into(), vec!["root".into()]);
        assert_eq!(route(&registry, HttpMethod::Post, "/api/x", &headers).as_deref(), Some("admin"));
        assert_eq!(route(&registry, HttpMethod::Get, "/api/x", &headers).as_deref(), Some("public"));
    }

    #[test]
    fn hint_restricts_style() {
        let registry = EndpointRegistry::new();
        registry
            .register(invoker("alb", &[json!({ "kind": "balancer", "paths": ["/ping"] })]))
            .unwrap();
        registry
            .register(invoker("apg", &[json!({ "kind": "gateway", "paths": ["/ping"] })]))
            .unwrap();

        let empty = MultiMap::new();
        let req = RouteRequest {
            method: HttpMethod::Get,
            path: "/ping",
            headers: &empty,
            query: &empty,
            raw_query: "",
        };
        assert_eq!(registry.route(&req, None).unwrap().invoker.name(), "alb");
        let gw = registry.route(&req, Some(EndpointStyle::Gateway)).unwrap();
        assert_eq!(gw.invoker.name(), "apg");
        assert_eq!(gw.descriptor.style(), EndpointStyle::Gateway);
    }

    #[test]
    fn reregistration_replaces_in_place() {
        let registry = EndpointRegistry::new();
        registry
            .register(invoker("f", &[json!({ "kind": "balancer", "paths": ["/old"] })]))
            .unwrap();
        registry
            .register(invoker("g", &[json!({ "kind": "balancer", "paths": ["/g"] })]))
            .unwrap();
        registry
            .register(invoker("f", &[json!({ "kind": "balancer", "paths": ["/new"] })]))
            .unwrap();

        let headers = MultiMap::new();
        assert_eq!(registry.len(), 2);
        assert_eq!(route(&registry, HttpMethod::Get, "/old", &headers), None);
        assert_eq!(route(&registry, HttpMethod::Get, "/new", &headers).as_deref(), Some("f"));
        let names: Vec<_> = registry.invokers().iter().map(|i| i.name().to_string()).collect();
        assert_eq!(names, ["f", "g"]);
    }

    #[test]
    fn invalid_endpoint_leaves_registry_unchanged() {
        let registry = EndpointRegistry::new();
        let err = registry
            .register(invoker("bad", &[json!({ "kind": "gateway", "paths": [], "version": 2 })]))
            .unwrap_err();
        assert!(matches!(err, ManifestError::Endpoint { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_by_arn_and_qualifier() {
        let registry = EndpointRegistry::new();
        registry.register(invoker("hello", &[])).unwrap();

        assert!(registry.get_by_name("hello").is_some());
        assert!(registry.get_by_name("hello:$LATEST").is_some());
        assert!(registry
            .get_by_name("arn:aws:lambda:us-east-1:000000000000:function:hello")
            .is_some());
        assert!(registry
            .get_by_name("arn:aws:lambda:us-east-1:000000000000:function:hello:prod")
            .is_some());
        assert!(registry.get_by_name("goodbye").is_none());
    }

    proptest! {
        #[test]
        fn exact_registration_always_wins(segment in "[a-z0-9]{1,12}", exact_first in any::<bool>()) {
            let registry = EndpointRegistry::new();
            let path = format!("/items/{segment}");
            let wild = invoker("wild", &[json!({ "kind": "balancer", "paths": ["/items/*"] })]);
            let exact = invoker("exact", &[json!({ "kind": "balancer", "paths": [path.clone()] })]);
            if exact_first {
                registry.register(exact).unwrap();
                registry.register(wild).unwrap();
            } else {
                registry.register(wild).unwrap();
                registry.register(exact).unwrap();
            }
            let headers = MultiMap::new();
            let routed = route(&registry, HttpMethod::Get, &path, &headers);
            prop_assert_eq!(routed.as_deref(), Some("exact"));
        }
    }
}
