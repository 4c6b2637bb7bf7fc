//! Function manifest: the list of function definitions the emulator serves.
//!
//! The manifest is produced by the build collaborator as JSON. Paths inside it
//! (handler modules) are relative to the manifest file's directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::{EndpointConfig, EndpointDescriptor, EndpointError};
use crate::pattern::{FilterCriteria, PatternError};

/// Default function timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 6;
/// Default memory size, in megabytes.
pub const DEFAULT_MEMORY_MB: u32 = 1024;
/// Account id used in locally generated ARNs.
pub const LOCAL_ACCOUNT_ID: &str = "000000000000";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("function {function:?}: {reason}")]
    Invalid { function: String, reason: String },
    #[error("function {function:?} is declared more than once")]
    DuplicateFunction { function: String },
    #[error("function {function:?}: {source}")]
    Endpoint {
        function: String,
        #[source]
        source: EndpointError,
    },
    #[error("function {function:?}: invalid filter pattern: {source}")]
    Filter {
        function: String,
        #[source]
        source: PatternError,
    },
}

/// Builds the ARN of a local function.
#[must_use]
pub fn function_arn(region: &str, name: &str) -> String {
    format!("arn:aws:lambda:{region}:{LOCAL_ACCOUNT_ID}:function:{name}")
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Language runtime a function is executed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Runtime {
    /// Embedded scripting engine, run on an in-process worker thread.
    Rhai,
    /// Python interpreter subprocess, e.g. `python3.12`.
    Python(String),
    /// Ruby interpreter subprocess, e.g. `ruby3.3`.
    Ruby(String),
    Unsupported(String),
}

impl Runtime {
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let lower = tag.to_ascii_lowercase();
        if lower == "rhai" {
            Self::Rhai
        } else if lower.starts_with("python") {
            Self::Python(lower)
        } else if lower.starts_with("ruby") {
            Self::Ruby(lower)
        } else {
            Self::Unsupported(tag.to_string())
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Rhai => "rhai",
            Self::Python(tag) | Self::Ruby(tag) | Self::Unsupported(tag) => tag,
        }
    }

    /// Default interpreter binary for subprocess runtimes: the tag up to its
    /// first `.` for Python (`python3.12` runs `python3`), `ruby` for Ruby.
    #[must_use]
    pub fn interpreter(&self) -> Option<&str> {
        match self {
            Self::Python(tag) => Some(tag.split('.').next().unwrap_or(tag)),
            Self::Ruby(_) => Some("ruby"),
            Self::Rhai | Self::Unsupported(_) => None,
        }
    }

    /// Source file extension of handler modules.
    #[must_use]
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Rhai => Some("rhai"),
            Self::Python(_) => Some("py"),
            Self::Ruby(_) => Some("rb"),
            Self::Unsupported(_) => None,
        }
    }
}

impl From<String> for Runtime {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Runtime> for String {
    fn from(value: Runtime) -> Self {
        value.tag().to_string()
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ---------------------------------------------------------------------------
// HandlerRef
// ---------------------------------------------------------------------------

/// `module/path.symbol`: a module path without extension plus the exported
/// symbol to call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerRef {
    pub module: String,
    pub symbol: String,
}

impl HandlerRef {
    /// Resolves the module file for `runtime` relative to `base_dir`.
    #[must_use]
    pub fn module_path(&self, base_dir: &Path, runtime: &Runtime) -> PathBuf {
        let mut path = base_dir.join(&self.module);
        if let Some(ext) = runtime.extension() {
            path.set_extension(ext);
        }
        path
    }
}

impl TryFrom<String> for HandlerRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.rsplit_once('.') {
            Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => Ok(Self {
                module: module.to_string(),
                symbol: symbol.to_string(),
            }),
            _ => Err(format!("handler {value:?} must look like `module.symbol`")),
        }
    }
}

impl From<HandlerRef> for String {
    fn from(value: HandlerRef) -> Self {
        format!("{}.{}", value.module, value.symbol)
    }
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
    Function,
}

impl DestinationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
            Self::Function => "function",
        }
    }
}

/// A delivery sink. Accepts `{ "kind": .., "name": .. }` or an ARN string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DestinationSpec")]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DestinationSpec {
    Arn(String),
    Explicit { kind: DestinationKind, name: String },
}

impl TryFrom<DestinationSpec> for Destination {
    type Error = String;

    fn try_from(spec: DestinationSpec) -> Result<Self, Self::Error> {
        match spec {
            DestinationSpec::Explicit { kind, name } => Ok(Self { kind, name }),
            DestinationSpec::Arn(arn) => Self::from_arn(&arn),
        }
    }
}

impl Destination {
    /// Parses `arn:aws:{sqs|sns|lambda}:...` ARNs.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the ARN service is unknown.
    pub fn from_arn(arn: &str) -> Result<Self, String> {
        let parts: Vec<&str> = arn.split(':').collect();
        let (service, name) = match parts.as_slice() {
            ["arn", _, "lambda", .., "function", name] | ["arn", _, "lambda", .., "function", name, _] => {
                ("lambda", *name)
            }
            ["arn", _, service, _, _, name] => (*service, *name),
            _ => return Err(format!("unrecognised destination {arn:?}")),
        };
        let kind = match service {
            "sqs" => DestinationKind::Queue,
            "sns" => DestinationKind::Topic,
            "lambda" => DestinationKind::Function,
            other => return Err(format!("unsupported destination service {other:?}")),
        };
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Queue triggers
// ---------------------------------------------------------------------------

/// Event source mapping from a queue to the declaring function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTrigger {
    pub queue: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds.
    #[serde(default)]
    pub maximum_batching_window: u64,
    /// Pattern objects or their JSON string encodings.
    #[serde(default)]
    pub filter_patterns: Vec<Value>,
    #[serde(default)]
    pub function_response_type: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl QueueTrigger {
    #[must_use]
    pub fn reports_item_failures(&self) -> bool {
        self.function_response_type.as_deref() == Some("ReportBatchItemFailures")
    }

    /// # Errors
    ///
    /// Returns an error if a pattern is not an object or a JSON string
    /// encoding one.
    pub fn filter_criteria(&self) -> Result<FilterCriteria, PatternError> {
        let decoded = self
            .filter_patterns
            .iter()
            .map(|p| match p {
                Value::String(s) => serde_json::from_str(s),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>, _>>()?;
        FilterCriteria::new(decoded)
    }
}

/// A queue the local backend creates at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDeclaration {
    pub name: String,
    /// Seconds a received message stays hidden before redelivery.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u64,
}

fn default_visibility_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// FunctionDefinition / Manifest
// ---------------------------------------------------------------------------

/// One function. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    pub name: String,
    /// Deployed name; defaults to `name`.
    #[serde(default)]
    pub output_name: Option<String>,
    pub runtime: Runtime,
    pub handler: HandlerRef,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_memory")]
    pub memory_size: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub on_success: Option<Destination>,
    #[serde(default)]
    pub on_failure: Option<Destination>,
    #[serde(default)]
    pub dead_letter: Option<Destination>,
    #[serde(default)]
    pub queues: Vec<QueueTrigger>,
    /// Directory handler modules are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_memory() -> u32 {
    DEFAULT_MEMORY_MB
}

impl FunctionDefinition {
    /// Minimal definition; the remaining fields take their defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, runtime: Runtime, handler: HandlerRef) -> Self {
        Self {
            name: name.into(),
            output_name: None,
            runtime,
            handler,
            timeout: None,
            memory_size: DEFAULT_MEMORY_MB,
            environment: BTreeMap::new(),
            endpoints: Vec::new(),
            on_success: None,
            on_failure: None,
            dead_letter: None,
            queues: Vec::new(),
            base_dir: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn output_name(&self) -> &str {
        self.output_name.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn timeout_secs(&self, default: u64) -> u64 {
        self.timeout.unwrap_or(default)
    }

    #[must_use]
    pub fn module_path(&self) -> PathBuf {
        self.handler.module_path(&self.base_dir, &self.runtime)
    }

    /// # Errors
    ///
    /// Returns the first endpoint that fails to compile.
    pub fn compile_endpoints(&self) -> Result<Vec<EndpointDescriptor>, ManifestError> {
        self.endpoints
            .iter()
            .cloned()
            .map(EndpointDescriptor::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ManifestError::Endpoint {
                function: self.name.clone(),
                source,
            })
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |reason: &str| ManifestError::Invalid {
            function: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.timeout == Some(0) {
            return Err(invalid("timeout must be at least one second"));
        }
        self.compile_endpoints()?;
        for trigger in &self.queues {
            if trigger.batch_size == 0 {
                return Err(invalid("queue batchSize must be positive"));
            }
            trigger
                .filter_criteria()
                .map_err(|source| ManifestError::Filter {
                    function: self.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDeclaration>,
}

impl Manifest {
    /// Parses a manifest; handler modules resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a function is invalid.
    pub fn from_json(json: &str, base_dir: &Path) -> Result<Self, ManifestError> {
        let mut manifest: Self = serde_json::from_str(json)?;
        for function in &mut manifest.functions {
            function.base_dir = base_dir.to_path_buf();
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validates every function and rejects names declared twice.
    ///
    /// # Errors
    ///
    /// Returns the first invalid or duplicated function.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = std::collections::HashSet::new();
        for function in &self.functions {
            function.validate()?;
            if !seen.insert(function.name.as_str()) {
                return Err(ManifestError::DuplicateFunction {
                    function: function.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails to parse.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let json = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = Self::from_json(&json, base_dir)?;
        tracing::debug!(
            path = %path.display(),
            functions = manifest.functions.len(),
            queues = manifest.queues.len(),
            "manifest loaded"
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn duplicate_function_names_are_rejected() {
        let json = json!({
            "functions": [
                { "name": "worker", "runtime": "rhai", "handler": "old.main" },
                { "name": "worker", "runtime": "rhai", "handler": "new.main" }
            ]
        })
        .to_string();
        let err = Manifest::from_json(&json, Path::new(".")).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateFunction { ref function } if function == "worker"));
    }

    #[test]
    fn runtime_tags() {
        assert_eq!(Runtime::parse("rhai"), Runtime::Rhai);
        assert_eq!(Runtime::parse("python3.12").interpreter(), Some("python3"));
        assert_eq!(Runtime::parse("ruby3.3").interpreter(), Some("ruby"));
        assert!(matches!(Runtime::parse("go1.x"), Runtime::Unsupported(_)));
        assert_eq!(Runtime::parse("go1.x").interpreter(), None);
    }

    #[test]
    fn handler_ref_splits_on_last_dot() {
        let h = HandlerRef::try_from("src/api.v2/users.handler".to_string()).unwrap();
        assert_eq!(h.module, "src/api.v2/users");
        assert_eq!(h.symbol, "handler");
        assert_eq!(
            h.module_path(Path::new("/srv"), &Runtime::Python("python3".into())),
            PathBuf::from("/srv/src/api.v2/users.py")
        );
        assert!(HandlerRef::try_from("nodot".to_string()).is_err());
    }

    #[test]
    fn destinations_from_arn_and_object() {
        let q: Destination =
            serde_json::from_value(json!("arn:aws:sqs:us-east-1:000000000000:orders")).unwrap();
        assert_eq!(q.kind, DestinationKind::Queue);
        assert_eq!(q.name, "orders");

        let f: Destination = serde_json::from_value(json!(
            "arn:aws:lambda:us-east-1:000000000000:function:audit"
        ))
        .unwrap();
        assert_eq!(f.kind, DestinationKind::Function);
        assert_eq!(f.name, "audit");

        let t: Destination =
            serde_json::from_value(json!({ "kind": "topic", "name": "alerts" })).unwrap();
        assert_eq!(t.kind, DestinationKind::Topic);

        assert!(serde_json::from_value::<Destination>(json!("arn:aws:s3:::bucket")).is_err());
    }

    #[test]
    fn manifest_parses_functions_and_queues() {
        let manifest = Manifest::from_json(
            &json!({
                "functions": [{
                    "name": "orders",
                    "runtime": "rhai",
                    "handler": "handlers/orders.handler",
                    "timeout": 3,
                    "endpoints": [{ "kind": "alb", "paths": ["/orders/*"], "methods": ["POST"] }],
                    "onFailure": { "kind": "queue", "name": "dlq" },
                    "queues": [{
                        "queue": "incoming",
                        "batchSize": 5,
                        "filterPatterns": ["{\"body\":{\"kind\":[\"order\"]}}"],
                        "functionResponseType": "ReportBatchItemFailures"
                    }]
                }],
                "queues": [{ "name": "incoming" }, { "name": "dlq", "visibilityTimeout": 5 }]
            })
            .to_string(),
            Path::new("/app"),
        )
        .unwrap();

        let f = &manifest.functions[0];
        assert_eq!(f.output_name(), "orders");
        assert_eq!(f.timeout_secs(DEFAULT_TIMEOUT_SECS), 3);
        assert_eq!(f.module_path(), PathBuf::from("/app/handlers/orders.rhai"));
        assert_eq!(f.compile_endpoints().unwrap().len(), 1);
        assert!(f.queues[0].reports_item_failures());
        assert!(f.queues[0].enabled);
        assert!(!f.queues[0].filter_criteria().unwrap().is_empty());
        assert_eq!(manifest.queues[0].visibility_timeout, 30);
    }

    #[test]
    fn invalid_function_is_rejected() {
        let err = Manifest::from_json(
            &json!({
                "functions": [{
                    "name": "bad",
                    "runtime": "rhai",
                    "handler": "h.run",
                    "endpoints": [{ "kind": "gateway", "version": 2, "paths": ["/x/"] }]
                }]
            })
            .to_string(),
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Endpoint { .. }));
    }

    #[test]
    fn arn_helper() {
        assert_eq!(
            function_arn("eu-west-1", "hello"),
            "arn:aws:lambda:eu-west-1:000000000000:function:hello"
        );
    }
}
