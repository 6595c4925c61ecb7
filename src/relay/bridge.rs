//! Message bridges between the WebSocket transport and in-process channels.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::trace;

use crate::error::RelayError;

/// Transport → channel.
///
/// Text frames are forwarded as-is and binary frames as lossy UTF-8. Control
/// frames are answered by the WebSocket layer and never forwarded. Ends with
/// `Ok` on a Close frame, end of stream, or when the receiving side is gone.
pub async fn transport_to_channel<S>(
    mut stream: S,
    tx: mpsc::Sender<String>,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let message = match frame? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(frame) => {
                trace!(?frame, "Close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        if tx.send(message).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Channel → transport, one text frame per message.
///
/// Borrows the sink so the caller can close the transport afterwards. Ends
/// with `Ok` once the channel is closed and drained.
pub async fn channel_to_transport<K>(
    rx: &mut mpsc::Receiver<String>,
    sink: &mut K,
) -> Result<(), RelayError>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.recv().await {
        sink.send(Message::text(message)).await?;
    }
    Ok(())
}
