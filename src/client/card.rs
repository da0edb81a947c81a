use std::sync::Arc;

use crate::client::events::Subscription;
use crate::client::remote::Remote;
use crate::core::apdu::{CommandApdu, ResponseApdu};
use crate::core::error::Result;
use crate::rpc::envelope::{Event, HandleId, Method, Value};

/// A remote card session. Valid until it, or its device, is released.
#[derive(Clone)]
pub struct CardProxy {
    remote: Arc<Remote>,
    handle: HandleId,
}

impl CardProxy {
    pub(crate) fn new(remote: Arc<Remote>, handle: HandleId) -> Self {
        Self { remote, handle }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    async fn invoke(&self, method: Method, args: Vec<Value>) -> Result<Value> {
        self.remote.invoke(Some(self.handle), method, args).await
    }

    pub async fn get_atr(&self) -> Result<Vec<u8>> {
        self.invoke(Method::CardGetAtr, vec![]).await?.into_bytes()
    }

    /// Structured in, structured out
    pub async fn transmit(&self, command: &CommandApdu) -> Result<ResponseApdu> {
        self.invoke(Method::CardTransmit, vec![Value::CommandApdu(command.clone())])
            .await?
            .into_response_apdu()
    }

    /// Raw bytes in, raw bytes out. The command is forwarded unchanged.
    pub async fn transmit_raw(&self, command: &[u8]) -> Result<Vec<u8>> {
        self.invoke(Method::CardTransmit, vec![Value::Bytes(command.to_vec())])
            .await?
            .into_bytes()
    }

    pub async fn reset(&self) -> Result<()> {
        self.invoke(Method::CardReset, vec![]).await?.into_unit()
    }

    pub async fn release(&self) -> Result<()> {
        self.invoke(Method::CardRelease, vec![]).await?.into_unit()
    }

    /// Subscribe to `card-removed` for this session
    pub fn on<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription::spawn(
            self.remote.transport().subscribe(),
            Some(self.handle),
            name,
            callback,
        )
    }
}

impl std::fmt::Debug for CardProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardProxy").field("handle", &self.handle).finish()
    }
}
