//! Newline-delimited JSON envelopes over any byte stream.
//!
//! This is the production transport: the stream is typically a TCP socket,
//! either straight to the server or to a relay that forwards frames unchanged.
//! Authentication happens before the stream is handed over here.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::error::BridgeError;
use crate::rpc::channel::{ChannelClient, ChannelServer};
use crate::rpc::envelope::{Envelope, Response};

/// Client endpoint over `stream`. Must be called inside a tokio runtime.
pub fn client<S>(stream: S, transport: &TransportConfig, config: &ClientConfig) -> ChannelClient
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (outbound, inbound) = spawn_framing(stream, transport.max_frame_len);
    ChannelClient::new(outbound, inbound, config)
}

/// Server endpoint over `stream`. Must be called inside a tokio runtime.
pub fn server<S>(stream: S, transport: &TransportConfig) -> ChannelServer
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (outbound, inbound) = spawn_framing(stream, transport.max_frame_len);
    ChannelServer::new(outbound, inbound)
}

/// Spawn the reader and writer tasks for `stream`.
///
/// Returns the sender the endpoint writes envelopes to and the receiver it reads
/// decoded envelopes from. Dropping the sender shuts the write side down; the
/// receiver ends when the peer closes or sends an oversized frame.
fn spawn_framing<S>(
    stream: S,
    max_frame_len: usize,
) -> (
    mpsc::UnboundedSender<Envelope>,
    mpsc::UnboundedReceiver<Envelope>,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames_in = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_frame_len));
    let mut frames_out =
        FramedWrite::new(write_half, LinesCodec::new_with_max_length(max_frame_len));

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
    // Answers to requests the reader could not decode; never keeps the writer alive
    let (rejects_tx, mut rejects_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                envelope = outbound_rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
                Some(reject) = rejects_rx.recv() => reject,
            };
            let line = match envelope.encode() {
                Ok(line) => line,
                Err(e) => {
                    log::error!("{e}");
                    continue;
                }
            };
            if let Err(e) = frames_out.send(line).await {
                log::warn!("Failed to write frame: {e}");
                break;
            }
        }
        let _ = SinkExt::<String>::close(&mut frames_out).await;
        log::debug!("Stream writer finished");
    });

    tokio::spawn(async move {
        while let Some(frame) = frames_in.next().await {
            let line = match frame {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("Closing stream after frame error: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Envelope::decode(&line) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => match reject_malformed(&line, &e) {
                    Some(reject) => {
                        log::warn!("Rejecting undecodable request: {e}");
                        let _ = rejects_tx.send(reject);
                    }
                    None => log::warn!("Skipping frame: {e}"),
                },
            }
        }
        log::debug!("Stream reader finished");
    });

    (outbound_tx, inbound_rx)
}

/// An `InvalidRequest` response for a frame that still names a request id,
/// so a peer on another stack is not left waiting on it
fn reject_malformed(line: &str, reason: &BridgeError) -> Option<Envelope> {
    let frame: serde_json::Value = serde_json::from_str(line).ok()?;
    if frame.get("type")?.as_str()? != "request" {
        return None;
    }
    let id = frame.get("id")?.as_u64()?;
    let error = BridgeError::InvalidRequest(format!("Malformed request: {reason}"));
    Some(Envelope::Response(Response::err(id, error.to_rpc())))
}
