use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use remora_playground::{
    remoter_test_contract, RemoterTest, RemoterTestClient, RemoterTestService, SERVICE_PATH,
};
use remora_rpc::{Client, Endpoint, RemoteService, RpcConfig, Server};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "remora-playground")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Hosts the demo service until interrupted.
    Serve {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Runs a scripted session against a running server.
    Demo {
        #[arg(long, default_value = "127.0.0.1:5561")]
        connect: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RpcConfig> {
    match path {
        Some(path) => {
            RpcConfig::from_path(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(RpcConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { listen, config } => serve(listen, config).await,
        Command::Demo { connect, config } => demo(&connect, config).await,
    }
}

async fn serve(listen: Option<String>, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let listen = listen.unwrap_or_else(|| config.server.listen.clone());

    let server = Server::new(config.server_options());
    server.register(Endpoint::new(SERVICE_PATH, remoter_test_contract()?, |_| {
        Ok(Arc::new(RemoterTestService::new()?) as Arc<dyn RemoteService>)
    }))?;

    let listener = TcpListener::bind(&listen).await.with_context(|| format!("binding {listen}"))?;
    log::info!("playground: serving {SERVICE_PATH} on {}", listener.local_addr()?);

    tokio::select! {
        _ = server.serve(listener) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            log::info!("playground: shutting down");
        }
    }
    server.shutdown();
    Ok(())
}

async fn demo(addr: &str, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_ref())?;
    let client = Client::connect(addr, config.client_options())
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let remoter = RemoterTestClient::open(&client).await?;
    remoter.on_property_changed(|change| log::info!("event: {} = {}", change.name, change.value))?;

    println!("Add(15, 10) = {}", remoter.add(15, 10).await?);
    println!("MyProperty = {:?}", remoter.my_property().await?);
    println!("OutTest -> {:?}", remoter.out_test().await?);

    let mut input = String::from(" it worked ");
    let returned = remoter.ref_test("ha", &mut input, "return value").await?;
    println!("RefTest -> {returned:?}, input now {input:?}");

    let source = remoter.get_interface("You got it back.").await?;
    println!("GetInterface().Get() = {:?}", source.get().await?);
    source.close().await?;

    let stream = remoter.get_random_stream(100).await?;
    let mut head = [0u8; 2];
    let read = stream.read(&mut head).await?;
    println!(
        "GetRandomStream(100): read {:?}, position {} of {}",
        String::from_utf8_lossy(&head[..read]),
        stream.position().await?,
        stream.len().await?
    );
    stream.dispose();

    match remoter.reverse("hello").await {
        Ok(text) => println!("Reverse -> {text:?}"),
        Err(err) => println!("Reverse failed as expected: {err}"),
    }

    remoter.close().await?;
    client.close();
    Ok(())
}
