//! A demo service and a typed client for it, used by the `remora-playground`
//! binary to exercise a server and a client end to end.

use std::sync::Arc;

use remora_rpc::{Contract, Operation, PropertyAccess, RpcError, TypeTag};
use serde::{Deserialize, Serialize};

pub mod service;
pub mod stub;

pub use service::{RemoterTestService, ValueSourceService};
pub use stub::{RemoterTest, RemoterTestClient, ValueSourceClient};

/// Path the demo service is hosted under.
pub const SERVICE_PATH: &str = "/path";

/// Payload of the `PropertyChanged` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub name: String,
    pub value: String,
}

pub fn value_source_contract() -> Result<Arc<Contract>, RpcError> {
    Contract::builder("ValueSource")
        .operation(Operation::new("Get").returns(TypeTag::String))
        .build()
}

pub fn remoter_test_contract() -> Result<Arc<Contract>, RpcError> {
    Contract::builder("RemoterTest")
        .property("MyProperty", TypeTag::String, PropertyAccess::ReadWrite)
        .event("PropertyChanged", TypeTag::named("PropertyChange"))
        .operation(
            Operation::new("Add")
                .param("one", TypeTag::I32)
                .param("two", TypeTag::I32)
                .returns(TypeTag::I32),
        )
        .operation(
            Operation::new("Reverse").param("input", TypeTag::String).returns(TypeTag::String),
        )
        .operation(
            Operation::new("RefTest")
                .param("addTo", TypeTag::String)
                .by_ref("input", TypeTag::String)
                .param("ret", TypeTag::String)
                .returns(TypeTag::String),
        )
        .operation(Operation::new("OutTest").out("input", TypeTag::String))
        .operation(
            Operation::new("GetRandomStream")
                .param("length", TypeTag::I32)
                .returns(TypeTag::Stream),
        )
        .operation(
            Operation::new("GetInterface")
                .param("input", TypeTag::String)
                .returns_service(value_source_contract()?),
        )
        .build()
}
