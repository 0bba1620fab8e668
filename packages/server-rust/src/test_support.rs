//! Shared fixtures for in-crate tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tether_core::{DynamicConverter, Element, ParamDescriptor};
use tokio_util::sync::CancellationToken;

use crate::ratelimit::TokenBucketOptions;
use crate::service::args::{ArgSlot, Args};
use crate::service::blueprint::{OperationBlueprint, OperationSetting};
use crate::service::contract::{Contract, ContractBuilder};
use crate::service::middleware::PipelineBuilder;
use crate::service::operation::{OperationContext, OperationError, OperationRequest};
use crate::service::provider::ServiceProvider;
use crate::service::registry::OperationRegistry;
use crate::subscription::Subscription;

/// A contract exercising every member shape.
#[derive(Default)]
pub struct Calculator {
    pub ticks: Subscription<u64>,
    pub secure_ticks: Subscription<u64>,
    pub admin_ticks: Subscription<u64>,
    calls: AtomicU32,
}

impl Calculator {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl Contract for Calculator {
    const NAME: &'static str = "calculator";

    fn describe(c: &mut ContractBuilder<Self>) {
        c.method("answer", vec![], |_svc, _args| async { Ok::<_, OperationError>(42_i64) });

        c.method(
            "add",
            vec![
                ParamDescriptor::value::<i64>("a"),
                ParamDescriptor::value::<i64>("b"),
            ],
            |svc, args| async move {
                svc.record_call();
                Ok::<_, OperationError>(args.get::<i64>(0)? + args.get::<i64>(1)?)
            },
        );

        c.method("reset", vec![], |svc, _args| async move {
            svc.record_call();
            Ok::<_, OperationError>(())
        });

        c.method("fail", vec![], |_svc, _args| async {
            Err::<(), _>(OperationError::internal("calculator exploded"))
        });

        c.method("admin_only", vec![], |_svc, _args| async { Ok::<_, OperationError>("granted") })
            .roles(["admin"]);

        c.method("slow", vec![], |_svc, _args| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, OperationError>(())
        })
        .configure(OperationSetting::Timeout(Duration::from_millis(50)));

        c.method("limited", vec![], |_svc, _args| async { Ok::<_, OperationError>(()) })
            .configure(OperationSetting::RateLimit(TokenBucketOptions::new(
                1,
                Duration::from_secs(3600),
            )));

        c.stream(
            "count_to",
            vec![ParamDescriptor::value::<u32>("n")],
            |_svc, args| async move {
                let n = args.get::<u32>(0)?;
                Ok::<_, OperationError>(stream::iter(1..=n).map(Ok::<u32, OperationError>))
            },
        );

        c.stream(
            "count_acked",
            vec![ParamDescriptor::value::<u32>("n")],
            |_svc, args| async move {
                let n = args.get::<u32>(0)?;
                Ok::<_, OperationError>(stream::iter(1..=n).map(Ok::<u32, OperationError>))
            },
        )
        .configure(OperationSetting::AckInterval(2));

        c.subscription("ticks", |svc| svc.ticks.clone());
        c.subscription("secure_ticks", |svc| svc.secure_ticks.clone())
            .authorize();
        c.subscription("admin_ticks", |svc| svc.admin_ticks.clone())
            .roles(["admin"]);

        c.stream(
            "admin_count",
            vec![ParamDescriptor::value::<u32>("n")],
            |_svc, args| async move {
                let n = args.get::<u32>(0)?;
                Ok::<_, OperationError>(stream::iter(1..=n).map(Ok::<u32, OperationError>))
            },
        )
        .roles(["admin"]);

        c.method(
            "sum_lines",
            vec![
                ParamDescriptor::value::<String>("label"),
                ParamDescriptor::sequence::<i64>("numbers"),
                ParamDescriptor::value::<i64>("offset"),
                ParamDescriptor::cancellation("ct"),
            ],
            |_svc, mut args| async move {
                let label = args.get::<String>(0)?;
                let offset = args.get::<i64>(2)?;
                let total = match args.stream_of::<i64>(1) {
                    Some(numbers) => {
                        let numbers: Vec<i64> = numbers
                            .collect::<Vec<_>>()
                            .await
                            .into_iter()
                            .collect::<Result<_, OperationError>>()?;
                        numbers.iter().sum::<i64>() + offset
                    }
                    None => -1,
                };
                Ok::<_, OperationError>(format!("{label}:{total}"))
            },
        );

        c.method(
            "stream_id",
            vec![
                ParamDescriptor::value::<i64>("a"),
                ParamDescriptor::sequence::<Element>("s"),
                ParamDescriptor::value::<i64>("b"),
            ],
            |_svc, mut args| async move { Ok::<_, OperationError>(args.stream(1).map(|s| s.id().to_string())) },
        );
    }
}

pub fn registry_with(pipeline: PipelineBuilder) -> OperationRegistry {
    let registry = OperationRegistry::new(pipeline);
    registry
        .register::<Calculator>()
        .expect("calculator contract registers");
    registry
}

pub fn default_registry() -> OperationRegistry {
    registry_with(PipelineBuilder::new())
}

pub fn services_with(calculator: Arc<Calculator>) -> Arc<ServiceProvider> {
    let services = ServiceProvider::new();
    services.register(calculator);
    Arc::new(services)
}

/// Context for `blueprint` with positional `args`, no transport and a
/// calculator registered as the service instance.
pub fn context_for(blueprint: &Arc<OperationBlueprint>, args: Vec<Element>) -> OperationContext {
    let converter = DynamicConverter::new();
    let cancel = CancellationToken::new();
    let slots = converter
        .deserialize_args(blueprint.params(), args.clone())
        .into_iter()
        .map(ArgSlot::from_encoded)
        .collect();
    let request = OperationRequest::new(blueprint.contract_name(), blueprint.operation_name(), args);
    OperationContext::new(
        Arc::clone(blueprint),
        request,
        services_with(Arc::new(Calculator::default())),
        None,
        cancel.clone(),
    )
    .with_arguments(Args::new(slots, converter, cancel))
}
