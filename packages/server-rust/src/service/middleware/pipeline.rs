//! Pipeline composition: orders middleware by category around the routing stage.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::service::blueprint::OperationBlueprint;
use crate::service::operation::{OperationContext, OperationError};

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// One stage of an operation pipeline.
///
/// A stage runs work before and after `next.run(ctx)`. Not calling `next`
/// short-circuits everything inward, including the routing stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage is included in `blueprint`'s pipeline. Evaluated
    /// once, when the pipeline is built.
    fn applies_to(&self, _blueprint: &OperationBlueprint) -> bool {
        true
    }

    /// # Errors
    ///
    /// Errors propagate outward to the enclosing stage.
    async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError>;
}

/// Continuation handed to each stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    split: usize,
    core: &'a dyn Middleware,
    position: usize,
}

impl<'a> Next<'a> {
    fn stage(&self) -> Option<&'a dyn Middleware> {
        use std::cmp::Ordering;

        match self.position.cmp(&self.split) {
            Ordering::Less => self.stages.get(self.position).map(AsRef::as_ref),
            Ordering::Equal => Some(self.core),
            Ordering::Greater => self.stages.get(self.position - 1).map(AsRef::as_ref),
        }
    }

    /// Runs the remainder of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first error not handled by an inner stage.
    pub async fn run(self, ctx: &mut OperationContext) -> Result<(), OperationError> {
        match self.stage() {
            Some(stage) => {
                let next = Self {
                    position: self.position + 1,
                    ..self
                };
                stage.invoke(ctx, next).await
            }
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered middleware chain of one blueprint, split around the routing stage.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    split: usize,
}

impl Pipeline {
    /// Executes the chain with `core` as the routing stage.
    ///
    /// # Errors
    ///
    /// Returns errors that escape every stage, i.e. when no exception stage
    /// is installed.
    pub async fn execute(&self, ctx: &mut OperationContext, core: &dyn Middleware) -> Result<(), OperationError> {
        Next {
            stages: &self.stages,
            split: self.split,
            core,
            position: 0,
        }
        .run(ctx)
        .await
    }

    /// Stage names in execution order; `"routing"` marks the core.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        names.insert(self.split, "routing");
        names
    }

    /// Number of stages, not counting the routing stage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Middleware categories in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareCategory {
    Exception,
    Logging,
    Authentication,
    PreRouting,
    /// Runs after the routing stage produced a result.
    PostRouting,
    /// At most one; a later registration replaces the earlier one.
    Response,
}

/// Collects middleware by category and builds per-blueprint pipelines.
///
/// Order, outermost first: Exception, Logging, Authentication, PreRouting,
/// routing, PostRouting, Response. Within a category, registration order.
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    exception: Vec<Arc<dyn Middleware>>,
    logging: Vec<Arc<dyn Middleware>>,
    authentication: Vec<Arc<dyn Middleware>>,
    pre_routing: Vec<Arc<dyn Middleware>>,
    post_routing: Vec<Arc<dyn Middleware>>,
    response: Option<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `middleware` under `category`.
    #[must_use]
    pub fn with(mut self, category: MiddlewareCategory, middleware: Arc<dyn Middleware>) -> Self {
        self.add(category, middleware);
        self
    }

    pub fn add(&mut self, category: MiddlewareCategory, middleware: Arc<dyn Middleware>) -> &mut Self {
        let bucket = match category {
            MiddlewareCategory::Exception => &mut self.exception,
            MiddlewareCategory::Logging => &mut self.logging,
            MiddlewareCategory::Authentication => &mut self.authentication,
            MiddlewareCategory::PreRouting => &mut self.pre_routing,
            MiddlewareCategory::PostRouting => &mut self.post_routing,
            MiddlewareCategory::Response => {
                if let Some(previous) = self.response.replace(middleware) {
                    tracing::warn!(
                        replaced = previous.name(),
                        "response middleware registered twice; keeping the latest"
                    );
                }
                return self;
            }
        };
        bucket.push(middleware);
        self
    }

    /// Builds the pipeline for one blueprint, keeping only applicable stages.
    #[must_use]
    pub fn build(&self, blueprint: &OperationBlueprint) -> Pipeline {
        let applicable = |m: &&Arc<dyn Middleware>| m.applies_to(blueprint);

        let mut stages: Vec<Arc<dyn Middleware>> = self
            .exception
            .iter()
            .chain(&self.logging)
            .chain(&self.authentication)
            .chain(&self.pre_routing)
            .filter(applicable)
            .cloned()
            .collect();
        let split = stages.len();
        stages.extend(
            self.post_routing
                .iter()
                .chain(self.response.as_ref())
                .filter(applicable)
                .cloned(),
        );
        Pipeline { stages, split }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tether_core::OperationKind;

    use super::*;
    use crate::service::operation::Produced;
    use crate::test_support::{context_for, registry_with};

    /// Records entry and exit into a shared log.
    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tracer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
            self.log.lock().push(format!("enter:{}", self.name));
            let result = next.run(ctx).await;
            self.log.lock().push(format!("exit:{}", self.name));
            result
        }
    }

    struct Core(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Core {
        fn name(&self) -> &'static str {
            "core"
        }

        async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
            self.0.lock().push("core".to_string());
            ctx.complete(Produced::Unit);
            next.run(ctx).await
        }
    }

    struct StreamsOnly;

    #[async_trait]
    impl Middleware for StreamsOnly {
        fn name(&self) -> &'static str {
            "streams_only"
        }

        fn applies_to(&self, blueprint: &OperationBlueprint) -> bool {
            blueprint.kind() == OperationKind::Stream
        }

        async fn invoke(&self, ctx: &mut OperationContext, next: Next<'_>) -> Result<(), OperationError> {
            next.run(ctx).await
        }
    }

    fn tracer(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Tracer {
            name,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn categories_run_in_fixed_order_around_routing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        // Registered out of order on purpose.
        let builder = PipelineBuilder::new()
            .with(MiddlewareCategory::Response, tracer("response", &log))
            .with(MiddlewareCategory::PreRouting, tracer("pre", &log))
            .with(MiddlewareCategory::Exception, tracer("exception", &log))
            .with(MiddlewareCategory::PostRouting, tracer("post", &log))
            .with(MiddlewareCategory::Authentication, tracer("auth", &log))
            .with(MiddlewareCategory::Logging, tracer("logging", &log));

        let registry = registry_with(builder);
        let blueprint = registry.resolve("calculator", "answer").unwrap();
        let mut ctx = context_for(&blueprint, vec![]);

        blueprint
            .pipeline()
            .execute(&mut ctx, &Core(Arc::clone(&log)))
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "enter:exception",
                "enter:logging",
                "enter:auth",
                "enter:pre",
                "core",
                "enter:post",
                "enter:response",
                "exit:response",
                "exit:post",
                "exit:pre",
                "exit:auth",
                "exit:logging",
                "exit:exception",
            ]
        );
        assert_eq!(
            blueprint.pipeline().stage_names(),
            vec!["exception", "logging", "auth", "pre", "routing", "post", "response"]
        );
    }

    #[tokio::test]
    async fn second_response_middleware_replaces_the_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let builder = PipelineBuilder::new()
            .with(MiddlewareCategory::Response, tracer("first", &log))
            .with(MiddlewareCategory::Response, tracer("second", &log));

        let registry = registry_with(builder);
        let blueprint = registry.resolve("calculator", "answer").unwrap();
        assert_eq!(blueprint.pipeline().stage_names(), vec!["routing", "second"]);
    }

    #[test]
    fn inapplicable_stages_are_filtered_per_blueprint() {
        let builder = PipelineBuilder::new().with(MiddlewareCategory::PreRouting, Arc::new(StreamsOnly));
        let registry = registry_with(builder);

        let method = registry.resolve("calculator", "answer").unwrap();
        assert!(method.pipeline().is_empty());

        let stream = registry.resolve("calculator", "count_to").unwrap();
        assert_eq!(stream.pipeline().stage_names(), vec!["streams_only", "routing"]);
    }

    #[tokio::test]
    async fn empty_pipeline_runs_only_the_core() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with(PipelineBuilder::new());
        let blueprint = registry.resolve("calculator", "answer").unwrap();
        let mut ctx = context_for(&blueprint, vec![]);

        blueprint
            .pipeline()
            .execute(&mut ctx, &Core(Arc::clone(&log)))
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["core"]);
        assert!(ctx.result.is_some());
    }
}
