//! Tether core: wire message schemas, contract shapes and the dynamic converter.

pub mod contract;
pub mod convert;
pub mod messages;
pub mod types;

pub use contract::{
    MemberShape, OperationKind, ParamDescriptor, ParamShape, ReturnDescriptor, ReturnShape,
};
pub use convert::{ConvertError, DynamicConverter, EncodedArg};
pub use messages::{LimitGroup, Message, MessageCategory, MessageType};
pub use types::{Element, Principal};

