#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use remora_rpc::{
    Arguments, Client, ClientOptions, Contract, Endpoint, EventHub, Operation, PropertyAccess,
    RemoteService, Reply, RpcError, Server, ServerOptions, SessionCache, TypeTag,
};
use serde::{Deserialize, Serialize};

pub const PATH: &str = "/calc";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub label: String,
}

pub fn memo_contract() -> Arc<Contract> {
    static CONTRACT: OnceLock<Arc<Contract>> = OnceLock::new();
    CONTRACT
        .get_or_init(|| {
            Contract::builder("Memo")
                .operation(Operation::new("Get").returns(TypeTag::String))
                .build()
                .expect("memo contract")
        })
        .clone()
}

fn binary(name: &str) -> Operation {
    Operation::new(name).param("a", TypeTag::I32).param("b", TypeTag::I32).returns(TypeTag::I32)
}

pub fn calculator_contract() -> Arc<Contract> {
    static CONTRACT: OnceLock<Arc<Contract>> = OnceLock::new();
    CONTRACT
        .get_or_init(|| {
            Contract::builder("Calculator")
                .operation(binary("Add"))
                .operation(binary("Divide"))
                .operation(
                    Operation::new("Swap")
                        .by_ref("left", TypeTag::String)
                        .by_ref("right", TypeTag::String),
                )
                .operation(
                    Operation::new("Digits").param("count", TypeTag::I32).returns(TypeTag::Stream),
                )
                .operation(Operation::new("Scratch").returns(TypeTag::Stream).writable())
                .operation(
                    Operation::new("Checksum").param("data", TypeTag::Stream).returns(TypeTag::U32),
                )
                .operation(
                    Operation::new("Child")
                        .param("text", TypeTag::String)
                        .returns_service(memo_contract()),
                )
                .operation(
                    Operation::new("Greet")
                        .optional("name", TypeTag::String)
                        .returns(TypeTag::String),
                )
                .operation(Operation::new("Explode"))
                .property("Label", TypeTag::String, PropertyAccess::ReadWrite)
                .event("Changed", TypeTag::named("Change"))
                .build()
                .expect("calculator contract")
        })
        .clone()
}

pub fn digits(count: usize) -> Vec<u8> {
    (0..count).map(|i| b'0' + (i % 10) as u8).collect()
}

pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

struct Memo {
    text: String,
}

#[async_trait]
impl RemoteService for Memo {
    fn contract(&self) -> Arc<Contract> {
        memo_contract()
    }

    async fn invoke(
        &self,
        operation: &Operation,
        _args: &mut Arguments,
    ) -> Result<Reply, RpcError> {
        match operation.name() {
            "Get" => Reply::value(&self.text),
            other => Err(RpcError::fault("NotSupported", format!("{other} is not implemented"))),
        }
    }
}

pub struct Calculator {
    label: Mutex<String>,
    events: EventHub,
    disposals: Arc<AtomicUsize>,
}

impl Calculator {
    pub fn new(disposals: Arc<AtomicUsize>) -> Self {
        Self { label: Mutex::new(String::new()), events: EventHub::new(), disposals }
    }
}

#[async_trait]
impl RemoteService for Calculator {
    fn contract(&self) -> Arc<Contract> {
        calculator_contract()
    }

    async fn invoke(&self, operation: &Operation, args: &mut Arguments) -> Result<Reply, RpcError> {
        match operation.name() {
            "Add" => Reply::value(&args.get::<i32>(0)?.wrapping_add(args.get::<i32>(1)?)),
            "Divide" => {
                let (a, b) = (args.get::<i32>(0)?, args.get::<i32>(1)?);
                if b == 0 {
                    return Err(RpcError::fault("DivideByZero", "Attempted to divide by zero."));
                }
                Reply::value(&(a / b))
            }
            "Swap" => {
                let left: String = args.get(0)?;
                let right: String = args.get(1)?;
                args.set(0, &right)?;
                args.set(1, &left)?;
                Ok(Reply::Void)
            }
            "Digits" => {
                let count: i32 = args.get(0)?;
                Ok(Reply::stream(Cursor::new(digits(count.max(0) as usize))))
            }
            "Scratch" => Ok(Reply::stream(Cursor::new(Vec::new()))),
            "Checksum" => {
                let stream = args.take_stream(0)?;
                let data = stream.read_to_end().await?;
                Reply::value(&checksum(&data))
            }
            "Child" => {
                let text: String = args.get(0)?;
                Ok(Reply::service(Memo { text }))
            }
            "Greet" => {
                let name = args.optional::<String>(0)?.unwrap_or_else(|| "stranger".to_string());
                Reply::value(&format!("hello {name}"))
            }
            "Explode" => panic!("boom"),
            "get_Label" => {
                let label = self.label.lock().expect("label").clone();
                Reply::value(&label)
            }
            "set_Label" => {
                let label: String = args.get(0)?;
                *self.label.lock().expect("label") = label.clone();
                self.events.emit("Changed", &Change { label })?;
                Ok(Reply::Void)
            }
            other => Err(RpcError::fault("NotSupported", format!("{other} is not implemented"))),
        }
    }

    fn events(&self) -> Option<&EventHub> {
        Some(&self.events)
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub server: Server,
    pub client: Client,
    pub disposals: Arc<AtomicUsize>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_server(Server::new(ServerOptions::default())).await
    }

    pub async fn with_sessions(sessions: Arc<SessionCache>) -> Self {
        Self::with_server(Server::with_session_cache(ServerOptions::default(), sessions)).await
    }

    async fn with_server(server: Server) -> Self {
        init_logging();
        let disposals = Arc::new(AtomicUsize::new(0));
        {
            let disposals = Arc::clone(&disposals);
            server
                .register(Endpoint::new(PATH, calculator_contract(), move |_| {
                    Ok(Arc::new(Calculator::new(Arc::clone(&disposals))) as Arc<dyn RemoteService>)
                }))
                .expect("register");
        }
        let client = connect(&server).await;
        Self { server, client, disposals }
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

/// A further client of `server` over an in-memory pipe.
pub async fn connect(server: &Server) -> Client {
    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    server.accept(server_io, None);
    Client::from_io(client_io, ClientOptions::default()).await.expect("client")
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
