//! `LocalFaaS` Core: function manifest, endpoint matching, event filter
//! patterns, and the runner wire protocol.

pub mod endpoint;
pub mod manifest;
pub mod pattern;
pub mod protocol;
pub mod trigger;

pub use endpoint::{
    EndpointConfig, EndpointDescriptor, EndpointError, EndpointKind, EndpointStyle, HttpMethod,
    MultiMap, RouteRequest,
};
pub use manifest::{
    function_arn, Destination, DestinationKind, FunctionDefinition, HandlerRef, Manifest,
    ManifestError, QueueDeclaration, QueueTrigger, Runtime,
};
pub use pattern::{matches, FilterCriteria, PatternError};
pub use protocol::{
    ErrorPayload, InvocationContext, StreamChunk, WorkerLine, WorkerMessage, WorkerReply,
};
pub use trigger::{TriggerInfo, TriggerKind};
