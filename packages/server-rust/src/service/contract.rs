//! Contract declaration API.
//!
//! A service type implements [`Contract`] and lists its members on a
//! [`ContractBuilder`]. Each member records its shape (parameters and return
//! value, or a subscription property) together with a bound invoker; the
//! registry later classifies the shape into an operation kind.
//!
//! ```ignore
//! impl Contract for Orders {
//!     const NAME: &'static str = "orders";
//!
//!     fn describe(c: &mut ContractBuilder<Self>) {
//!         c.method("get", vec![ParamDescriptor::value::<u64>("id")], |svc, args| async move {
//!             svc.get(args.get(0)?).await
//!         })
//!         .authorize();
//!         c.subscription("changed", |svc| svc.changed.clone());
//!     }
//! }
//! ```

use std::any::{type_name, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tether_core::{MemberShape, ParamDescriptor, ReturnDescriptor};

use super::args::Args;
use super::blueprint::{AuthorizeData, InvokeFn, Invoker, OperationConfig, OperationSetting, ServiceInstance, SubscribeFn};
use super::operation::{OperationError, Produced};
use crate::subscription::{Subscription, SubscriptionHandle};

/// A service type whose members are exposed as remote operations.
pub trait Contract: Send + Sync + Sized + 'static {
    /// Wire name of the contract.
    const NAME: &'static str;

    fn describe(contract: &mut ContractBuilder<Self>);
}

/// One declared member of a contract.
#[derive(Debug)]
pub struct MemberDescriptor {
    pub name: String,
    pub shape: MemberShape,
    pub authorization: AuthorizeData,
    pub config: OperationConfig,
    /// `None` for members that cannot be dispatched.
    pub invoker: Option<Invoker>,
}

/// Declared members of one contract, ready for registration.
#[derive(Debug)]
pub struct ContractDescriptor {
    pub name: String,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub members: Vec<MemberDescriptor>,
}

impl ContractDescriptor {
    /// Runs the contract's `describe` and collects its members.
    #[must_use]
    pub fn of<C: Contract>() -> Self {
        let mut builder = ContractBuilder::<C>::new();
        C::describe(&mut builder);
        builder.finish()
    }
}

// ---------------------------------------------------------------------------
// ContractBuilder
// ---------------------------------------------------------------------------

pub struct ContractBuilder<S> {
    name: String,
    members: Vec<MemberDescriptor>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Contract> ContractBuilder<S> {
    fn new() -> Self {
        Self {
            name: S::NAME.to_string(),
            members: Vec::new(),
            _service: PhantomData,
        }
    }

    fn finish(self) -> ContractDescriptor {
        ContractDescriptor {
            name: self.name,
            type_id: TypeId::of::<S>(),
            type_name: type_name::<S>(),
            members: self.members,
        }
    }

    fn push(&mut self, name: &str, shape: MemberShape, invoker: Option<Invoker>) -> MemberOptions<'_> {
        self.members.push(MemberDescriptor {
            name: name.to_string(),
            shape,
            authorization: AuthorizeData::default(),
            config: OperationConfig::default(),
            invoker,
        });
        let index = self.members.len() - 1;
        MemberOptions {
            member: &mut self.members[index],
        }
    }

    /// Declares a member returning a single value (or `()`).
    ///
    /// Declaring a sequence parameter makes the member an ingest operation.
    pub fn method<R, F, Fut>(&mut self, name: &str, params: Vec<ParamDescriptor>, handler: F) -> MemberOptions<'_>
    where
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    {
        let unit = TypeId::of::<R>() == TypeId::of::<()>();
        let returns = if unit {
            ReturnDescriptor::unit()
        } else {
            ReturnDescriptor::value::<R>()
        };
        let invoke: InvokeFn = Arc::new(move |instance: ServiceInstance, args: Args| {
            let call = downcast::<S>(instance).map(|service| handler(service, args));
            async move {
                let value = call?.await?;
                Ok::<_, OperationError>(if unit {
                    Produced::Unit
                } else {
                    Produced::Value(Box::new(value))
                })
            }
            .boxed()
        });
        self.push(
            name,
            MemberShape::Method { params, returns },
            Some(Invoker::Call(invoke)),
        )
    }

    /// Declares a member producing a lazily consumed sequence of `T`.
    pub fn stream<T, St, F, Fut>(&mut self, name: &str, params: Vec<ParamDescriptor>, handler: F) -> MemberOptions<'_>
    where
        T: Serialize + Send + 'static,
        St: Stream<Item = Result<T, OperationError>> + Send + 'static,
        F: Fn(Arc<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<St, OperationError>> + Send + 'static,
    {
        let invoke: InvokeFn = Arc::new(move |instance: ServiceInstance, args: Args| {
            let converter = args.converter();
            let call = downcast::<S>(instance).map(|service| handler(service, args));
            async move {
                let items = call?.await?;
                let elements = items.map(move |item| {
                    item.and_then(|value| {
                        converter
                            .serialize_to_element(&value)
                            .map_err(|e| OperationError::encode(&e))
                    })
                });
                Ok::<_, OperationError>(Produced::Stream(elements.boxed()))
            }
            .boxed()
        });
        self.push(
            name,
            MemberShape::Method {
                params,
                returns: ReturnDescriptor::sequence::<T>(),
            },
            Some(Invoker::Call(invoke)),
        )
    }

    /// Declares a subscription property exposing `Subscription<T>`.
    pub fn subscription<T, F>(&mut self, name: &str, accessor: F) -> MemberOptions<'_>
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn(&S) -> Subscription<T> + Send + Sync + 'static,
    {
        let subscribe: SubscribeFn = Arc::new(move |instance: &ServiceInstance| {
            let service = downcast::<S>(Arc::clone(instance))?;
            Ok::<_, OperationError>(Arc::new(accessor(service.as_ref())) as Arc<dyn SubscriptionHandle>)
        });
        self.push(
            name,
            MemberShape::Property {
                type_name: type_name::<Subscription<T>>(),
                subscription: true,
            },
            Some(Invoker::Subscribe(subscribe)),
        )
    }

    /// Declares a plain property. Plain properties are not dispatchable and
    /// are rejected at registration.
    pub fn property<T: ?Sized>(&mut self, name: &str) -> MemberOptions<'_> {
        self.push(
            name,
            MemberShape::Property {
                type_name: type_name::<T>(),
                subscription: false,
            },
            None,
        )
    }
}

fn downcast<S: Send + Sync + 'static>(instance: ServiceInstance) -> Result<Arc<S>, OperationError> {
    instance
        .downcast::<S>()
        .map_err(|_| OperationError::internal(format!("service instance is not a {}", type_name::<S>())))
}

// ---------------------------------------------------------------------------
// MemberOptions
// ---------------------------------------------------------------------------

/// Attribute-style options for the member just declared.
pub struct MemberOptions<'a> {
    member: &'a mut MemberDescriptor,
}

impl MemberOptions<'_> {
    /// Requires an authenticated caller.
    pub fn authorize(self) -> Self {
        self.member.authorization.required = true;
        self
    }

    /// Requires every listed role. Implies [`authorize`](Self::authorize).
    pub fn roles<I, R>(self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        let auth = &mut self.member.authorization;
        auth.required = true;
        auth.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Requires every listed policy. Implies [`authorize`](Self::authorize).
    pub fn policies<I, P>(self, policies: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let auth = &mut self.member.authorization;
        auth.required = true;
        auth.policies.extend(policies.into_iter().map(Into::into));
        self
    }

    pub fn configure(self, setting: OperationSetting) -> Self {
        self.member.config.insert(setting);
        self
    }
}
