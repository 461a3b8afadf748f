use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{stream::SplitSink, stream::SplitStream, SinkExt, StreamExt};
use shared::{domain::UserId, protocol::Frame};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

/// Fixed reconnect delay. Retries are unbounded at this interval while the
/// server stays down. A known simplification, kept rather than silently
/// capped.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected { identity: UserId },
    Frame(Frame),
    /// Raw audio payload for the external playback collaborator.
    AudioChunk(Vec<u8>),
    Closed { will_retry: bool },
}

struct ChannelState {
    /// Bumped by every explicit connect/shutdown; a reader or reconnect
    /// task whose generation no longer matches has been superseded and
    /// stands down.
    generation: u64,
    identity: Option<UserId>,
    writer: Option<WsSink>,
}

/// The one full-duplex signaling channel per logged-in identity.
///
/// `send` never raises: a `false` return means "transport unavailable" and
/// callers fall back on their own redundant delivery paths. Unexpected
/// closures schedule exactly one reconnect after [`RECONNECT_DELAY`],
/// re-running the original connect with the original identity.
pub struct SignalingTransport {
    base_url: String,
    events: mpsc::Sender<SignalingEvent>,
    inner: Mutex<ChannelState>,
}

impl SignalingTransport {
    pub fn new(base_url: impl Into<String>, events: mpsc::Sender<SignalingEvent>) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.into(),
            events,
            inner: Mutex::new(ChannelState {
                generation: 0,
                identity: None,
                writer: None,
            }),
        })
    }

    /// Idempotent: an existing channel is torn down before the new dial.
    /// A failed dial still leaves the retry loop running, so the channel
    /// recovers once the server comes back.
    pub async fn connect(self: &Arc<Self>, identity: UserId) -> Result<()> {
        let (generation, stale_writer) = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            state.identity = Some(identity.clone());
            (state.generation, state.writer.take())
        };
        if let Some(mut writer) = stale_writer {
            let _ = writer.send(Message::Close(None)).await;
        }
        self.dial(identity, generation).await
    }

    pub async fn shutdown(&self) {
        let writer = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            state.identity = None;
            state.writer.take()
        };
        if let Some(mut writer) = writer {
            let _ = writer.send(Message::Close(None)).await;
        }
        let _ = self
            .events
            .send(SignalingEvent::Closed { will_retry: false })
            .await;
    }

    pub async fn send(&self, frame: &Frame) -> bool {
        self.send_raw(Message::Text(frame.encode())).await
    }

    pub async fn send_chunk(&self, chunk: Vec<u8>) -> bool {
        self.send_raw(Message::Binary(chunk)).await
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.writer.is_some()
    }

    async fn send_raw(&self, message: Message) -> bool {
        let mut state = self.inner.lock().await;
        let Some(writer) = state.writer.as_mut() else {
            debug!("signaling send skipped; channel not open");
            return false;
        };
        match writer.send(message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "signaling send failed");
                state.writer = None;
                false
            }
        }
    }

    async fn dial(self: &Arc<Self>, identity: UserId, generation: u64) -> Result<()> {
        let url = self.channel_url(&identity)?;
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                let (writer, reader) = stream.split();
                {
                    let mut state = self.inner.lock().await;
                    if state.generation != generation {
                        // Superseded while dialing; the new channel owns the
                        // connection lifecycle now.
                        return Ok(());
                    }
                    state.writer = Some(writer);
                }
                info!(identity = %identity, "signaling channel connected");
                let _ = self
                    .events
                    .send(SignalingEvent::Connected {
                        identity: identity.clone(),
                    })
                    .await;
                self.spawn_reader(reader, generation);
                Ok(())
            }
            Err(err) => {
                warn!(identity = %identity, error = %err, "signaling dial failed; retrying");
                self.schedule_reconnect(generation);
                Err(anyhow!("signaling dial failed: {err}"))
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: WsSource, generation: u64) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match Frame::parse(&text) {
                        Ok(frame) => {
                            let _ = transport.events.send(SignalingEvent::Frame(frame)).await;
                        }
                        Err(err) => warn!(error = %err, raw = %text, "unparseable signaling frame"),
                    },
                    Ok(Message::Binary(chunk)) => {
                        let _ = transport
                            .events
                            .send(SignalingEvent::AudioChunk(chunk))
                            .await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "signaling receive failed");
                        break;
                    }
                }
            }
            transport.handle_closure(generation).await;
        });
    }

    async fn handle_closure(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            state.writer = None;
        }
        warn!("signaling channel closed unexpectedly");
        let _ = self
            .events
            .send(SignalingEvent::Closed { will_retry: true })
            .await;
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let identity = {
                let state = transport.inner.lock().await;
                if state.generation != generation {
                    return;
                }
                state.identity.clone()
            };
            let Some(identity) = identity else { return };
            info!(identity = %identity, "reconnecting signaling channel");
            // A failed dial schedules the next retry itself.
            let _ = transport.dial(identity, generation).await;
        });
    }

    fn channel_url(&self, identity: &UserId) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid signaling url: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("signaling url cannot carry an identity path"))?
            .pop_if_empty()
            .push(identity.as_str());
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
