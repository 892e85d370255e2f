//! Contract descriptors: the operations, properties and events a remote
//! service exposes, described once at registration time.
//!
//! Both sides derive signature strings from the same descriptor, so a client
//! stub and a server adapter built from one [`Contract`] always agree.

use std::sync::Arc;

use remora_wire::{ParamType, Signature, TypeTag};

use crate::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamMode {
    In,
    /// Value goes in and the callee's update comes back.
    Ref,
    /// Only the callee's value comes back.
    Out,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: TypeTag,
    pub mode: ParamMode,
    pub optional: bool,
}

impl Param {
    pub fn is_by_ref(&self) -> bool {
        self.mode != ParamMode::In
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyAccess {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug)]
pub struct Operation {
    name: String,
    params: Vec<Param>,
    returns: TypeTag,
    writable_stream: bool,
    service: Option<Arc<Contract>>,
}

impl Operation {
    /// A `void` operation with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: TypeTag::Void,
            writable_stream: false,
            service: None,
        }
    }

    fn push(
        mut self,
        name: impl Into<String>,
        ty: TypeTag,
        mode: ParamMode,
        optional: bool,
    ) -> Self {
        self.params.push(Param { name: name.into(), ty, mode, optional });
        self
    }

    pub fn param(self, name: impl Into<String>, ty: TypeTag) -> Self {
        self.push(name, ty, ParamMode::In, false)
    }

    /// An input the caller may omit; the callee sees it as missing.
    pub fn optional(self, name: impl Into<String>, ty: TypeTag) -> Self {
        self.push(name, ty, ParamMode::In, true)
    }

    pub fn by_ref(self, name: impl Into<String>, ty: TypeTag) -> Self {
        self.push(name, ty, ParamMode::Ref, false)
    }

    pub fn out(self, name: impl Into<String>, ty: TypeTag) -> Self {
        self.push(name, ty, ParamMode::Out, false)
    }

    pub fn returns(mut self, ty: TypeTag) -> Self {
        self.returns = ty;
        self
    }

    /// Returns a nested service implementing `contract`.
    pub fn returns_service(mut self, contract: Arc<Contract>) -> Self {
        self.returns = TypeTag::Contract(contract.name().to_string());
        self.service = Some(contract);
        self
    }

    /// Lets the caller write to a returned stream. Streams are read-only
    /// otherwise.
    pub fn writable(mut self) -> Self {
        self.writable_stream = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn return_type(&self) -> &TypeTag {
        &self.returns
    }

    pub fn is_writable_stream(&self) -> bool {
        self.writable_stream
    }

    /// Descriptor of the nested contract this operation returns, if any.
    pub fn service_contract(&self) -> Option<&Arc<Contract>> {
        self.service.as_ref()
    }

    pub fn signature(&self) -> Signature {
        Signature::new(
            self.name.clone(),
            self.params
                .iter()
                .map(|p| ParamType { ty: p.ty.clone(), by_ref: p.is_by_ref() })
                .collect(),
            self.returns.clone(),
        )
    }

    fn validate(&self, contract: &str) -> Result<(), RpcError> {
        let fail = |reason: String| RpcError::Registration {
            message: format!("{contract}.{}: {reason}", self.name),
        };
        let signature = self.signature();
        let rendered = signature.to_string();
        match rendered.parse::<Signature>() {
            Ok(parsed) if parsed == signature => {}
            Ok(_) => return Err(fail(format!("signature `{rendered}` does not parse back"))),
            Err(err) => return Err(fail(err.to_string())),
        }
        for param in &self.params {
            if param.optional && param.mode != ParamMode::In {
                return Err(fail(format!("by-ref parameter {} cannot be optional", param.name)));
            }
            if matches!(param.ty, TypeTag::Contract(_)) {
                return Err(fail(format!("parameter {} cannot be a service", param.name)));
            }
        }
        if matches!(self.returns, TypeTag::Contract(_)) && self.service.is_none() {
            return Err(fail("service returns need a contract descriptor".into()));
        }
        if self.writable_stream && !self.returns.is_stream() {
            return Err(fail("only stream returns can be writable".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDescriptor {
    pub name: String,
    /// Structured argument type delivered with each firing.
    pub args: TypeTag,
}

#[derive(Debug)]
pub struct Contract {
    name: String,
    operations: Vec<Operation>,
    events: Vec<EventDescriptor>,
}

impl Contract {
    pub fn builder(name: impl Into<String>) -> ContractBuilder {
        ContractBuilder { name: name.into(), operations: Vec::new(), events: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn events(&self) -> &[EventDescriptor] {
        &self.events
    }

    /// The one operation whose signature matches exactly.
    pub fn find(&self, signature: &Signature) -> Option<&Operation> {
        self.operations.iter().find(|op| op.signature() == *signature)
    }

    /// First operation named `name`.
    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.iter().find(|event| event.name == name)
    }
}

pub struct ContractBuilder {
    name: String,
    operations: Vec<Operation>,
    events: Vec<EventDescriptor>,
}

impl ContractBuilder {
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Adds `get_{name}` and, when writable, `set_{name}`.
    pub fn property(mut self, name: &str, ty: TypeTag, access: PropertyAccess) -> Self {
        self.operations.push(Operation::new(format!("get_{name}")).returns(ty.clone()));
        if access == PropertyAccess::ReadWrite {
            self.operations.push(Operation::new(format!("set_{name}")).param("value", ty));
        }
        self
    }

    pub fn event(mut self, name: impl Into<String>, args: TypeTag) -> Self {
        self.events.push(EventDescriptor { name: name.into(), args });
        self
    }

    pub fn build(self) -> Result<Arc<Contract>, RpcError> {
        let registration = |message: String| RpcError::Registration { message };
        if self.name.is_empty() {
            return Err(registration("contract name is empty".into()));
        }
        TypeTag::Contract(self.name.clone())
            .to_string()
            .parse::<TypeTag>()
            .map_err(|err| registration(err.to_string()))?;

        for (index, operation) in self.operations.iter().enumerate() {
            operation.validate(&self.name)?;
            let signature = operation.signature();
            if self.operations[..index].iter().any(|earlier| earlier.signature() == signature) {
                return Err(registration(format!("{}: `{signature}` is declared twice", self.name)));
            }
        }
        for (index, event) in self.events.iter().enumerate() {
            if !matches!(event.args, TypeTag::Named(_)) {
                return Err(registration(format!(
                    "{}.{}: event arguments must be a structured type, not {}",
                    self.name, event.name, event.args
                )));
            }
            if self.events[..index].iter().any(|earlier| earlier.name == event.name) {
                return Err(registration(format!("{}.{} is declared twice", self.name, event.name)));
            }
        }
        Ok(Arc::new(Contract { name: self.name, operations: self.operations, events: self.events }))
    }
}
