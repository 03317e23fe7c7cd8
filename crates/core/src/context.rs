//! Per-request metadata passed through the coordinator into telemetry.

use std::sync::Arc;

use crate::endpoint::EndpointKey;
use crate::identity::IdentityProfile;
use crate::session::Credential;

/// Describes one logical request for tracking and alerting.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: EndpointKey,
    pub operation: Option<String>,
    pub query: Option<String>,
    /// Identity to use instead of the coordinator's current one
    pub identity: Option<Arc<IdentityProfile>>,
}

impl RequestContext {
    pub fn new(endpoint: impl Into<EndpointKey>) -> Self {
        Self { endpoint: endpoint.into(), operation: None, query: None, identity: None }
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Arc<IdentityProfile>) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// What an operation receives when the coordinator runs it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub endpoint: EndpointKey,
    pub identity: Arc<IdentityProfile>,
    /// Cached or freshly acquired credential for `identity`, if any
    pub credential: Option<Credential>,
    /// Randomized request headers for `identity` and `endpoint`
    pub headers: Vec<(String, String)>,
}
