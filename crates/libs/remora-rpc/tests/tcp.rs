mod support;

use std::sync::Arc;
use std::time::Duration;

use remora_rpc::{
    CallArg, Client, ClientOptions, Endpoint, RemoteService, RpcError, Server, ServerOptions, Value,
};
use remora_wire::frame::{read_frame, write_frame};
use support::{calculator_contract, Calculator, PATH};
use tokio::net::{TcpListener, TcpStream};

async fn serve() -> (Server, String) {
    support::init_logging();
    let server = Server::new(ServerOptions::default());
    server
        .register(Endpoint::new(PATH, calculator_contract(), |_| {
            Ok(Arc::new(Calculator::new(Default::default())) as Arc<dyn RemoteService>)
        }))
        .expect("register");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
    }
    (server, addr)
}

#[tokio::test]
async fn clients_call_through_a_tcp_listener() {
    let (server, addr) = serve().await;
    let client = Client::connect(&addr, ClientOptions::default()).await.expect("connect");
    let proxy = client.open(PATH, calculator_contract()).await.expect("open");

    let sum: i32 = proxy
        .call("Add", vec![CallArg::Value(Value::from(15)), CallArg::Value(Value::from(10))])
        .await
        .expect("add")
        .value()
        .expect("int");
    assert_eq!(sum, 25);

    server.shutdown();
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn the_server_rejects_other_protocol_versions() {
    let (_server, addr) = serve().await;
    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    write_frame(&mut stream, &Value::F64(2.0)).await.expect("write");
    let reply = read_frame(&mut stream).await.expect("read");
    assert_eq!(reply, Some(Value::from("Unsupported version")));
    assert_eq!(read_frame(&mut stream).await.expect("eof"), None);
}

#[tokio::test]
async fn handshake_retries_are_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let options = ClientOptions {
        retry_handshake: true,
        handshake_attempts: 3,
        retry_delay: Duration::from_millis(10),
        ..ClientOptions::default()
    };
    let started = std::time::Instant::now();
    let err = Client::connect(&addr, options).await.expect_err("nobody listens");
    assert!(matches!(err, RpcError::ChannelFault { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(20));
}
