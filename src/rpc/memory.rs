//! In-process transport: a client and server endpoint joined by channels.

use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::rpc::channel::{ChannelClient, ChannelServer};

/// Create a connected client/server pair. Must be called inside a tokio runtime.
pub fn pair() -> (ChannelClient, ChannelServer) {
    pair_with_config(&ClientConfig::default())
}

pub fn pair_with_config(config: &ClientConfig) -> (ChannelClient, ChannelServer) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();

    (
        ChannelClient::new(to_server, from_server, config),
        ChannelServer::new(to_client, from_client),
    )
}
