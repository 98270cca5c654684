use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use parlor_proto::Envelope;

use crate::error::PeerError;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connection to the relay, split into an outbound queue and an
/// inbound stream of parsed envelopes.
pub(crate) struct RelayLink {
    outbox: mpsc::UnboundedSender<Envelope>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    task_handle: JoinHandle<()>,
}

impl RelayLink {
    /// Connect and queue `register` as the first frame.
    pub(crate) async fn connect(url: &Url, username: &str) -> Result<Self, PeerError> {
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!(%url, username, "connected to relay");

        let (outbox, outbound) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Envelope>();
        outbox
            .send(Envelope::register(username))
            .map_err(|_| PeerError::Signaling("relay link closed before register".into()))?;

        let task_handle = tokio::spawn(handle_websocket(ws_stream, outbound, inbound_tx));
        Ok(Self {
            outbox,
            inbound,
            task_handle,
        })
    }

    pub(crate) fn outbox(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbox.clone()
    }

    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Close the websocket once every outbox clone is gone and queued frames
    /// are flushed. Gives up after `CLOSE_GRACE` and drops the socket.
    pub(crate) async fn close(self) {
        drop(self.outbox);
        drop(self.inbound);
        let mut task_handle = self.task_handle;
        if timeout(CLOSE_GRACE, &mut task_handle).await.is_err() {
            debug!("relay link did not drain in time, aborting");
            task_handle.abort();
        }
    }
}

async fn handle_websocket(
    ws_stream: RelaySocket,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(kind = envelope.kind(), error = %e, "could not encode envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "relay send failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                    Ok(envelope) => {
                        debug!(kind = envelope.kind(), "relay frame");
                        if inbound.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping unparseable relay frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "relay connection error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!("relay link task finished");
}
