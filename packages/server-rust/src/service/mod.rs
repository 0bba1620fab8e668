//! Contract registration and operation execution.
//!
//! 1. **Contracts** (`contract`, `classify`): typed contract descriptions
//!    turned into member shapes
//! 2. **Registry** (`registry`, `blueprint`): immutable blueprints per operation
//! 3. **Middleware** (`middleware`): onion pipeline around the routing stage
//! 4. **Handler** (`handler`): entry points per operation kind
//! 5. **Arguments** (`args`, `ingest`): positional values and client streams

pub mod args;
pub mod blueprint;
pub mod classify;
pub mod config;
pub mod contract;
pub mod handler;
pub mod ingest;
pub mod middleware;
pub mod operation;
pub mod provider;
pub mod registry;

pub use args::{ArgSlot, Args};
pub use blueprint::{AuthorizeData, OperationBlueprint, OperationConfig, OperationKey, OperationSetting};
pub use config::ServerConfig;
pub use contract::{Contract, ContractBuilder, ContractDescriptor, MemberOptions};
pub use handler::{Rejection, RequestHandler};
pub use ingest::{IngestStream, IngestStreamRegistry, StreamSource};
pub use operation::{
    OperationContext, OperationError, OperationRequest, ResponseEnvelope, TransportContext,
};
pub use provider::{IdentityAccessor, ServiceProvider, StaticIdentity};
pub use registry::{OperationRegistry, RegistryError};
