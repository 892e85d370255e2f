use async_trait::async_trait;
use remora_rpc::{CallArg, Client, EventArgs, HandlerId, Proxy, RemoteStream, RpcError};

use crate::{remoter_test_contract, PropertyChange, SERVICE_PATH};

/// The demo contract as seen by a caller.
#[async_trait]
pub trait RemoterTest: Send + Sync {
    async fn my_property(&self) -> Result<String, RpcError>;
    async fn set_my_property(&self, value: &str) -> Result<(), RpcError>;
    async fn add(&self, one: i32, two: i32) -> Result<i32, RpcError>;
    async fn reverse(&self, input: &str) -> Result<String, RpcError>;
    /// Appends `add_to` to `input` on the server and returns `ret`.
    async fn ref_test(
        &self,
        add_to: &str,
        input: &mut String,
        ret: &str,
    ) -> Result<String, RpcError>;
    async fn out_test(&self) -> Result<String, RpcError>;
    async fn get_random_stream(&self, length: i32) -> Result<RemoteStream, RpcError>;
    async fn get_interface(&self, input: &str) -> Result<ValueSourceClient, RpcError>;
}

/// Typed wrapper over a [`Proxy`] opened on the demo contract.
#[derive(Clone, Debug)]
pub struct RemoterTestClient {
    proxy: Proxy,
}

impl RemoterTestClient {
    /// Opens a fresh session at [`SERVICE_PATH`].
    pub async fn open(client: &Client) -> Result<Self, RpcError> {
        Self::open_at(client, SERVICE_PATH).await
    }

    pub async fn open_at(client: &Client, path: &str) -> Result<Self, RpcError> {
        Ok(Self { proxy: client.open(path, remoter_test_contract()?).await? })
    }

    /// Runs `handler` for every `PropertyChanged` firing on this session.
    pub fn on_property_changed<F>(&self, handler: F) -> Result<HandlerId, RpcError>
    where
        F: Fn(PropertyChange) + Send + Sync + 'static,
    {
        self.proxy.on("PropertyChanged", move |_: &Proxy, args: &EventArgs| {
            match args.decode::<PropertyChange>() {
                Ok(change) => handler(change),
                Err(err) => log::warn!("playground: undecodable PropertyChanged payload: {err}"),
            }
        })
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.proxy.close().await
    }
}

impl AsRef<Proxy> for RemoterTestClient {
    fn as_ref(&self) -> &Proxy {
        &self.proxy
    }
}

#[async_trait]
impl RemoterTest for RemoterTestClient {
    async fn my_property(&self) -> Result<String, RpcError> {
        self.proxy.get("MyProperty").await
    }

    async fn set_my_property(&self, value: &str) -> Result<(), RpcError> {
        self.proxy.set("MyProperty", value).await
    }

    async fn add(&self, one: i32, two: i32) -> Result<i32, RpcError> {
        self.proxy.call("Add", vec![CallArg::value(&one)?, CallArg::value(&two)?]).await?.value()
    }

    async fn reverse(&self, input: &str) -> Result<String, RpcError> {
        self.proxy.call("Reverse", vec![CallArg::value(input)?]).await?.value()
    }

    async fn ref_test(
        &self,
        add_to: &str,
        input: &mut String,
        ret: &str,
    ) -> Result<String, RpcError> {
        let args =
            vec![CallArg::value(add_to)?, CallArg::value(input.as_str())?, CallArg::value(ret)?];
        let invocation = self.proxy.call("RefTest", args).await?;
        *input = invocation.ref_arg(1)?;
        invocation.value()
    }

    async fn out_test(&self) -> Result<String, RpcError> {
        self.proxy.call("OutTest", vec![CallArg::Missing]).await?.ref_arg(0)
    }

    async fn get_random_stream(&self, length: i32) -> Result<RemoteStream, RpcError> {
        self.proxy.call("GetRandomStream", vec![CallArg::value(&length)?]).await?.into_stream()
    }

    async fn get_interface(&self, input: &str) -> Result<ValueSourceClient, RpcError> {
        let proxy =
            self.proxy.call("GetInterface", vec![CallArg::value(input)?]).await?.into_service()?;
        Ok(ValueSourceClient { proxy })
    }
}

/// Typed wrapper over the nested `ValueSource` service.
#[derive(Clone, Debug)]
pub struct ValueSourceClient {
    proxy: Proxy,
}

impl ValueSourceClient {
    pub async fn get(&self) -> Result<String, RpcError> {
        self.proxy.call("Get", Vec::new()).await?.value()
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.proxy.close().await
    }
}

impl AsRef<Proxy> for ValueSourceClient {
    fn as_ref(&self) -> &Proxy {
        &self.proxy
    }
}
