//! Immutable per-operation metadata computed once at registration.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tether_core::{OperationKind, ParamDescriptor, Principal, ReturnDescriptor};

use super::args::Args;
use super::middleware::Pipeline;
use super::operation::{OperationError, Produced};
use crate::ratelimit::TokenBucketOptions;
use crate::subscription::SubscriptionHandle;

/// Type-erased service instance as stored in the [`ServiceProvider`](super::ServiceProvider).
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Invokes a method, stream or ingest handler on a resolved service instance.
pub type InvokeFn =
    Arc<dyn Fn(ServiceInstance, Args) -> BoxFuture<'static, Result<Produced, OperationError>> + Send + Sync>;

/// Reads the subscription member of a resolved service instance.
pub type SubscribeFn =
    Arc<dyn Fn(&ServiceInstance) -> Result<Arc<dyn SubscriptionHandle>, OperationError> + Send + Sync>;

/// Bound delegate used by the routing stage.
#[derive(Clone)]
pub enum Invoker {
    Call(InvokeFn),
    Subscribe(SubscribeFn),
}

impl fmt::Debug for Invoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(_) => f.write_str("Invoker::Call"),
            Self::Subscribe(_) => f.write_str("Invoker::Subscribe"),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization metadata
// ---------------------------------------------------------------------------

/// Authorization requirements attached to a contract member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeData {
    pub required: bool,
    /// Every listed role must be held by the caller.
    pub roles: Vec<String>,
    /// Every listed policy must be granted to the caller.
    pub policies: Vec<String>,
}

impl AuthorizeData {
    /// Checks the caller against these requirements.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when no principal is present, `Forbidden` when a role or
    /// policy is missing.
    pub fn check(&self, principal: Option<&Principal>) -> Result<(), OperationError> {
        if !self.required {
            return Ok(());
        }
        let principal = principal.ok_or(OperationError::Unauthorized)?;
        if let Some(role) = self.roles.iter().find(|r| !principal.has_role(r)) {
            return Err(OperationError::Forbidden {
                reason: format!("missing role {role}"),
            });
        }
        if let Some(policy) = self.policies.iter().find(|p| !principal.has_policy(p)) {
            return Err(OperationError::Forbidden {
                reason: format!("missing policy {policy}"),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-operation configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    RateLimit,
    ChannelCapacity,
    Throttle,
    Timeout,
    AckInterval,
}

/// A single configuration attribute attached to a contract member.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationSetting {
    /// Operation-level token bucket.
    RateLimit(TokenBucketOptions),
    /// Buffer size of client-pushed ingest streams.
    ChannelCapacity(usize),
    /// Minimum delay between two elements of an outbound sequence.
    Throttle(Duration),
    Timeout(Duration),
    /// Every n-th outbound element requests an acknowledgement.
    AckInterval(u32),
}

impl OperationSetting {
    #[must_use]
    pub fn kind(&self) -> ConfigKind {
        match self {
            Self::RateLimit(_) => ConfigKind::RateLimit,
            Self::ChannelCapacity(_) => ConfigKind::ChannelCapacity,
            Self::Throttle(_) => ConfigKind::Throttle,
            Self::Timeout(_) => ConfigKind::Timeout,
            Self::AckInterval(_) => ConfigKind::AckInterval,
        }
    }
}

/// Settings keyed by kind; the last setting of a kind wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationConfig {
    settings: HashMap<ConfigKind, OperationSetting>,
}

impl OperationConfig {
    pub fn insert(&mut self, setting: OperationSetting) {
        self.settings.insert(setting.kind(), setting);
    }

    #[must_use]
    pub fn get(&self, kind: ConfigKind) -> Option<&OperationSetting> {
        self.settings.get(&kind)
    }

    #[must_use]
    pub fn rate_limit(&self) -> Option<&TokenBucketOptions> {
        match self.get(ConfigKind::RateLimit) {
            Some(OperationSetting::RateLimit(options)) => Some(options),
            _ => None,
        }
    }

    #[must_use]
    pub fn channel_capacity(&self) -> Option<usize> {
        match self.get(ConfigKind::ChannelCapacity) {
            Some(OperationSetting::ChannelCapacity(capacity)) => Some(*capacity),
            _ => None,
        }
    }

    #[must_use]
    pub fn throttle(&self) -> Option<Duration> {
        match self.get(ConfigKind::Throttle) {
            Some(OperationSetting::Throttle(delay)) => Some(*delay),
            _ => None,
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self.get(ConfigKind::Timeout) {
            Some(OperationSetting::Timeout(timeout)) => Some(*timeout),
            _ => None,
        }
    }

    #[must_use]
    pub fn ack_interval(&self) -> Option<u32> {
        match self.get(ConfigKind::AckInterval) {
            Some(OperationSetting::AckInterval(n)) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// OperationBlueprint
// ---------------------------------------------------------------------------

/// Key of an operation within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub contract: String,
    pub operation: String,
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.contract, self.operation)
    }
}

/// Everything needed to dispatch one operation. Shared read-only after
/// registration.
pub struct OperationBlueprint {
    key: OperationKey,
    kind: OperationKind,
    contract_type: TypeId,
    contract_type_name: &'static str,
    params: Vec<ParamDescriptor>,
    returns: Option<ReturnDescriptor>,
    authorization: AuthorizeData,
    config: OperationConfig,
    invoker: Invoker,
    pipeline: Pipeline,
}

impl OperationBlueprint {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: OperationKey,
        kind: OperationKind,
        contract_type: TypeId,
        contract_type_name: &'static str,
        params: Vec<ParamDescriptor>,
        returns: Option<ReturnDescriptor>,
        authorization: AuthorizeData,
        config: OperationConfig,
        invoker: Invoker,
    ) -> Self {
        Self {
            key,
            kind,
            contract_type,
            contract_type_name,
            params,
            returns,
            authorization,
            config,
            invoker,
            pipeline: Pipeline::default(),
        }
    }

    pub(crate) fn set_pipeline(&mut self, pipeline: Pipeline) {
        self.pipeline = pipeline;
    }

    #[must_use]
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    #[must_use]
    pub fn contract_name(&self) -> &str {
        &self.key.contract
    }

    #[must_use]
    pub fn operation_name(&self) -> &str {
        &self.key.operation
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// `TypeId` of the contract's service type, used to resolve the instance.
    #[must_use]
    pub fn contract_type(&self) -> TypeId {
        self.contract_type
    }

    #[must_use]
    pub fn contract_type_name(&self) -> &'static str {
        self.contract_type_name
    }

    #[must_use]
    pub fn params(&self) -> &[ParamDescriptor] {
        &self.params
    }

    /// Return descriptor; `None` for subscriptions.
    #[must_use]
    pub fn returns(&self) -> Option<&ReturnDescriptor> {
        self.returns.as_ref()
    }

    #[must_use]
    pub fn authorization(&self) -> &AuthorizeData {
        &self.authorization
    }

    #[must_use]
    pub fn requires_authorization(&self) -> bool {
        self.authorization.required
    }

    #[must_use]
    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    #[must_use]
    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Number of cancellation parameters at the end of the parameter list.
    /// The server supplies these; callers never send them.
    #[must_use]
    pub fn trailing_cancellation_count(&self) -> usize {
        self.params
            .iter()
            .rev()
            .take_while(|p| p.is_cancellation())
            .count()
    }
}

impl fmt::Debug for OperationBlueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationBlueprint")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("authorization", &self.authorization)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
