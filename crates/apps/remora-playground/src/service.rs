use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use remora_rpc::{Arguments, Contract, EventHub, Operation, RemoteService, Reply, RpcError};

use crate::{remoter_test_contract, PropertyChange};

const RANDOM_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// `length` random bytes drawn from `A-Z0-9`.
pub fn random_text(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    for byte in &mut bytes {
        *byte = RANDOM_ALPHABET[usize::from(*byte) % RANDOM_ALPHABET.len()];
    }
    bytes
}

/// Server side of the demo contract.
pub struct RemoterTestService {
    contract: Arc<Contract>,
    property: Mutex<String>,
    events: EventHub,
}

impl RemoterTestService {
    pub fn new() -> Result<Self, RpcError> {
        Ok(Self {
            contract: remoter_test_contract()?,
            property: Mutex::new(String::new()),
            events: EventHub::new(),
        })
    }

    fn property(&self) -> String {
        self.property.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn set_property(&self, value: String) -> Result<(), RpcError> {
        *self.property.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = value.clone();
        let change = PropertyChange { name: "MyProperty".into(), value };
        let fired = self.events.emit("PropertyChanged", &change)?;
        log::trace!("playground: PropertyChanged reached {fired} subscriber(s)");
        Ok(())
    }

    fn value_source(&self, input: String) -> Result<Reply, RpcError> {
        let contract = self
            .contract
            .operation("GetInterface")
            .and_then(|op| op.service_contract())
            .cloned()
            .ok_or_else(|| RpcError::invalid_state("GetInterface declares no service contract"))?;
        Ok(Reply::service(ValueSourceService { contract, value: input }))
    }
}

#[async_trait]
impl RemoteService for RemoterTestService {
    fn contract(&self) -> Arc<Contract> {
        Arc::clone(&self.contract)
    }

    async fn invoke(&self, operation: &Operation, args: &mut Arguments) -> Result<Reply, RpcError> {
        match operation.name() {
            "get_MyProperty" => Reply::value(&self.property()),
            "set_MyProperty" => {
                self.set_property(args.get(0)?)?;
                Ok(Reply::Void)
            }
            "Add" => {
                let sum = args.get::<i32>(0)?.wrapping_add(args.get::<i32>(1)?);
                self.set_property(sum.to_string())?;
                Reply::value(&sum)
            }
            "Reverse" => Err(RpcError::fault("NotSupported", "Specified method is not supported.")),
            "RefTest" => {
                let add_to: String = args.get(0)?;
                let input: String = args.get(1)?;
                args.set(1, &format!("{input}{add_to}"))?;
                Reply::value(&args.get::<String>(2)?)
            }
            "OutTest" => {
                args.set(0, "HAHA")?;
                Ok(Reply::Void)
            }
            "GetRandomStream" => {
                let length = usize::try_from(args.get::<i32>(0)?).unwrap_or(0);
                Ok(Reply::stream(Cursor::new(random_text(length))))
            }
            "GetInterface" => self.value_source(args.get(0)?),
            other => Err(RpcError::fault("NotSupported", format!("{other} is not implemented"))),
        }
    }

    fn events(&self) -> Option<&EventHub> {
        Some(&self.events)
    }

    fn dispose(&self) {
        log::debug!("playground: RemoterTest instance disposed");
    }
}

/// Nested service handed out by `GetInterface`.
pub struct ValueSourceService {
    contract: Arc<Contract>,
    value: String,
}

#[async_trait]
impl RemoteService for ValueSourceService {
    fn contract(&self) -> Arc<Contract> {
        Arc::clone(&self.contract)
    }

    async fn invoke(
        &self,
        operation: &Operation,
        _args: &mut Arguments,
    ) -> Result<Reply, RpcError> {
        match operation.name() {
            "Get" => Reply::value(&self.value),
            other => Err(RpcError::fault("NotSupported", format!("{other} is not implemented"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_rpc::{Arg, Value};

    fn op(service: &RemoterTestService, name: &str) -> Operation {
        service.contract().operation(name).cloned().expect("operation")
    }

    #[test]
    fn random_text_stays_inside_the_alphabet() {
        let text = random_text(512);
        assert_eq!(text.len(), 512);
        assert!(text.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        assert!(random_text(0).is_empty());
    }

    #[tokio::test]
    async fn add_updates_the_property_and_fires_the_event() {
        let service = RemoterTestService::new().expect("service");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = Arc::clone(&seen);
            service.events.subscribe("PropertyChanged", move |value: &Value| {
                seen.lock().expect("seen").push(value.clone());
            })
        };

        let mut args =
            Arguments::new(vec![Arg::Value(Value::from(15)), Arg::Value(Value::from(10))]);
        let reply = service.invoke(&op(&service, "Add"), &mut args).await.expect("add");
        assert!(matches!(reply, Reply::Value(Value::Integer(n)) if n.as_i64() == Some(25)));
        assert_eq!(service.property(), "25");
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[tokio::test]
    async fn ref_test_appends_to_the_by_ref_argument() {
        let service = RemoterTestService::new().expect("service");
        let mut args = Arguments::new(vec![
            Arg::Value(Value::from("ha")),
            Arg::Value(Value::from(" it worked ")),
            Arg::Value(Value::from("return value")),
        ]);
        let reply = service.invoke(&op(&service, "RefTest"), &mut args).await.expect("ref test");
        assert!(matches!(
            reply,
            Reply::Value(Value::String(ref s)) if s.as_str() == Some("return value")
        ));
        assert_eq!(args.get::<String>(1).expect("written back"), " it worked ha");
    }

    #[tokio::test]
    async fn reverse_always_faults_as_not_supported() {
        let service = RemoterTestService::new().expect("service");
        let mut args = Arguments::new(vec![Arg::Value(Value::from("hello"))]);
        let err = service.invoke(&op(&service, "Reverse"), &mut args).await.expect_err("fault");
        assert_eq!(err.kind(), "NotSupported");
    }
}
