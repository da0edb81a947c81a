use std::sync::Arc;

use crate::core::error::{BridgeError, Result};
use crate::rpc::envelope::{HandleId, Method, Request, Value};
use crate::rpc::transport::ClientTransport;

/// Call context shared by every proxy spawned from one platform proxy
pub(crate) struct Remote {
    transport: Arc<dyn ClientTransport>,
}

impl Remote {
    pub(crate) fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self { transport }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.transport
    }

    /// One round trip: send `method` to `target` and wait for its outcome
    pub(crate) async fn invoke(
        &self,
        target: Option<HandleId>,
        method: Method,
        args: Vec<Value>,
    ) -> Result<Value> {
        if self.transport.is_closed() {
            return Err(BridgeError::connection_closed());
        }

        let request = Request::new(self.transport.next_call_id(), target, method, args);
        let response = self.transport.call(request).await?;
        response.into_result()
    }
}
