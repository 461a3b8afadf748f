use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{CallId, CallRole, ConversationKey, GroupName, UserId},
    protocol::{
        CallInfo, CallLogStatus, CallRequestPayload, Frame, HistoryRecord, IceCandidate,
        MessageContent, PendingRecord, RpcPush, SessionDescription, SignalKind, StreamFormat,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod cache;
pub mod call;
pub mod config;
pub mod invoker;
pub mod negotiation;
pub mod pending;
pub mod poll;
pub mod signaling;

pub use cache::{CachedMessage, MessageCache};
pub use call::{CallEnd, CallError, CallMachine, CallSession, CallState, EndReason};
pub use config::{load_settings, ClientSettings};
pub use invoker::{HttpRpcChannel, Route, RpcChannel, RpcError, RpcInvoker};
pub use negotiation::{
    LinkEvent, LinkState, MissingPeerConnector, NegotiationCoordinator, PeerConnector, PeerLink,
};
pub use pending::PendingOfferStore;
pub use poll::PollHandle;
pub use signaling::{SignalingEvent, SignalingTransport};

use call::IncomingDisposition;

/// The single tagged event stream surfaced to the UI collaborator.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        key: ConversationKey,
        message: CachedMessage,
    },
    IncomingCall {
        caller: UserId,
        call_id: CallId,
    },
    CallStateChanged {
        state: CallState,
        peer: Option<UserId>,
    },
    CallRejected {
        by: UserId,
    },
    CallEnded {
        peer: UserId,
        duration_ms: u64,
    },
    /// Decoded audio for the external playback collaborator.
    AudioChunk {
        data: Vec<u8>,
    },
    Error(String),
}

/// Everything inbound funnels through this one stream so that a single
/// dispatcher serializes cache insertions and call-machine transitions.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Signaling(SignalingEvent),
    Push(RpcPush),
    Poll(PendingRecord),
    Link(LinkEvent),
}

#[derive(Debug, Serialize)]
struct GatewayUserRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Session-scoped mutable state. One mutex serializes every mutation, which
/// is what upholds the per-conversation insertion ordering and the
/// single-active-call invariant.
struct SessionState {
    identity: Option<UserId>,
    invoker: Option<Arc<RpcInvoker>>,
    machine: CallMachine,
    pending_offers: PendingOfferStore,
    cache: MessageCache,
    poll: Option<PollHandle>,
    push_tasks: Vec<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            identity: None,
            invoker: None,
            machine: CallMachine::new(),
            pending_offers: PendingOfferStore::new(),
            cache: MessageCache::new(),
            poll: None,
            push_tasks: Vec::new(),
            link_task: None,
        }
    }
}

/// Client facade tying the transports, the call machine, and the dedup
/// cache together behind an explicit session context, no ambient globals.
pub struct ChatClient {
    settings: ClientSettings,
    http: reqwest::Client,
    signaling: Arc<SignalingTransport>,
    negotiation: Arc<NegotiationCoordinator>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
    inbound_tx: mpsc::Sender<InboundEvent>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings, connector: Arc<dyn PeerConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (signal_tx, mut signal_rx) = mpsc::channel(256);

        let client = Arc::new(Self {
            signaling: SignalingTransport::new(settings.signaling_url.clone(), signal_tx),
            negotiation: Arc::new(NegotiationCoordinator::new(connector)),
            settings,
            http: reqwest::Client::new(),
            inner: Mutex::new(SessionState::new()),
            events,
            inbound_tx,
        });

        {
            let forward = client.inbound_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = signal_rx.recv().await {
                    if forward.send(InboundEvent::Signaling(event)).await.is_err() {
                        break;
                    }
                }
            });
        }
        Arc::clone(&client).spawn_dispatcher(inbound_rx);

        client
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    // ---- session lifecycle ------------------------------------------------

    pub async fn login(self: &Arc<Self>, username: impl Into<String>) -> Result<()> {
        let identity = UserId::new(username);
        {
            let inner = self.inner.lock().await;
            if inner.identity.is_some() {
                return Err(anyhow!("already logged in; log out first"));
            }
        }

        let login_url = format!("{}/login", self.settings.api_url);
        let ack: AckResponse = self
            .http
            .post(&login_url)
            .json(&GatewayUserRequest {
                username: identity.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("login request to {login_url} failed"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid login response")?;
        if !ack.success {
            return Err(anyhow!(
                "login rejected: {}",
                ack.message.unwrap_or_default()
            ));
        }

        let channel = HttpRpcChannel::new(self.settings.rpc_url.clone(), identity.clone());
        let invoker = Arc::new(RpcInvoker::new(Arc::new(channel)));

        // Real-time push is best-effort; signaling and the poll loop cover
        // for it when the subscription cannot be established.
        let mut push_tasks = Vec::new();
        let subscriber_id = Uuid::new_v4().to_string();
        match invoker.subscribe(&identity, &subscriber_id).await {
            Ok(()) => {
                let (push_tx, mut push_rx) = mpsc::channel(64);
                match invoker::spawn_push_reader(&self.settings.rpc_events_url, &identity, push_tx)
                    .await
                {
                    Ok(reader) => {
                        let forward = self.inbound_tx.clone();
                        let bridge = tokio::spawn(async move {
                            while let Some(push) = push_rx.recv().await {
                                if forward.send(InboundEvent::Push(push)).await.is_err() {
                                    break;
                                }
                            }
                        });
                        push_tasks.push(reader);
                        push_tasks.push(bridge);
                    }
                    Err(err) => {
                        warn!(error = %err, "push socket unavailable; relying on signaling and polling")
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "event subscription failed; relying on signaling and polling")
            }
        }

        if let Err(err) = self.signaling.connect(identity.clone()).await {
            warn!(error = %err, "signaling connect failed; reconnect scheduled");
        }

        let poll = poll::spawn_poll_loop(
            self.http.clone(),
            self.settings.api_url.clone(),
            identity.clone(),
            Duration::from_millis(self.settings.poll_interval_ms),
            self.inbound_tx.clone(),
        );

        {
            let mut inner = self.inner.lock().await;
            inner.identity = Some(identity.clone());
            inner.invoker = Some(Arc::clone(&invoker));
            inner.poll = Some(poll);
            inner.push_tasks = push_tasks;
        }

        self.backfill_history(&identity, &invoker).await;
        info!(identity = %identity, "logged in");
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        // End an active call first so the peer is not left hanging.
        let _ = self.hang_up().await;

        let (identity, poll, push_tasks, link_task) = {
            let mut inner = self.inner.lock().await;
            let identity = inner
                .identity
                .take()
                .ok_or_else(|| anyhow!("not logged in"))?;
            inner.invoker = None;
            inner.machine = CallMachine::new();
            inner.pending_offers.clear();
            (
                identity,
                inner.poll.take(),
                std::mem::take(&mut inner.push_tasks),
                inner.link_task.take(),
            )
        };

        if let Some(poll) = poll {
            poll.stop();
        }
        for task in push_tasks {
            task.abort();
        }
        if let Some(task) = link_task {
            task.abort();
        }
        self.signaling.shutdown().await;

        let logout_url = format!("{}/logout", self.settings.api_url);
        if let Err(err) = self
            .http
            .post(&logout_url)
            .json(&GatewayUserRequest {
                username: identity.to_string(),
            })
            .send()
            .await
        {
            warn!(error = %err, "gateway logout failed");
        }
        info!(identity = %identity, "logged out");
        Ok(())
    }

    // ---- messaging --------------------------------------------------------

    pub async fn send_message(&self, to: &UserId, body: &str) -> Result<()> {
        let (identity, invoker) = self.session().await?;
        let content = MessageContent::text(body);
        invoker.send_message(to.as_str(), &content.render()).await?;
        self.record_sent(ConversationKey::User(to.clone()), identity, content)
            .await;
        Ok(())
    }

    pub async fn send_group_message(&self, group: &GroupName, body: &str) -> Result<()> {
        let (identity, invoker) = self.session().await?;
        let content = MessageContent::text(body);
        invoker
            .send_message(&format!("#{group}"), &content.render())
            .await?;
        self.record_sent(ConversationKey::Group(group.clone()), identity, content)
            .await;
        Ok(())
    }

    pub async fn send_audio(&self, to: &UserId, audio: &[u8], duration_ms: u64) -> Result<()> {
        let (identity, invoker) = self.session().await?;
        let payload = STANDARD.encode(audio);
        invoker.send_audio(to.as_str(), &payload).await?;
        let content = MessageContent::Audio {
            data: payload,
            duration_ms,
        };
        self.record_sent(ConversationKey::User(to.clone()), identity, content)
            .await;
        Ok(())
    }

    pub async fn conversation(&self, key: &ConversationKey) -> Vec<CachedMessage> {
        self.inner.lock().await.cache.conversation(key).to_vec()
    }

    // ---- calls ------------------------------------------------------------

    pub async fn start_call(self: &Arc<Self>, peer: &UserId) -> Result<CallId> {
        let (identity, invoker) = self.session().await?;
        {
            let inner = self.inner.lock().await;
            if let Some(session) = inner.machine.session() {
                return Err(CallError::Busy(session.remote_user.clone()).into());
            }
        }

        let (offer, link_events) = match self.negotiation.start_outbound().await {
            Ok(result) => result,
            Err(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("cannot establish call: {err}")));
                return Err(err.into());
            }
        };

        let call_id = {
            let mut inner = self.inner.lock().await;
            match inner
                .machine
                .start_call(&identity, peer.clone(), offer.clone(), Utc::now())
            {
                Ok(call_id) => call_id,
                Err(err) => {
                    drop(inner);
                    self.negotiation.close().await;
                    return Err(err.into());
                }
            }
        };
        self.watch_link(link_events).await;
        self.emit_call_state().await;

        let payload = serde_json::to_string(&CallRequestPayload::new(offer)).unwrap_or_default();
        if !self
            .signaling
            .send(&Frame::Signal {
                peer: peer.clone(),
                kind: SignalKind::CallRequest,
                payload,
            })
            .await
        {
            debug!("signaling unavailable for call request; relying on middleware delivery");
        }

        match invoker.start_call(&identity, peer).await {
            Ok(call) => {
                let mut inner = self.inner.lock().await;
                inner.machine.adopt_call_id(call.call_id.clone());
                Ok(call.call_id)
            }
            Err(err) => {
                warn!(error = %err, "middleware start_call failed; relying on signaling delivery");
                Ok(call_id)
            }
        }
    }

    pub async fn accept_call(self: &Arc<Self>) -> Result<()> {
        let caller = {
            let inner = self.inner.lock().await;
            inner.machine.begin_accept()?
        };
        let offer = {
            let mut inner = self.inner.lock().await;
            match self
                .negotiation
                .consume_offer(&mut inner.pending_offers, &caller)
            {
                Ok(offer) => offer,
                Err(err) => {
                    inner.machine.end_call(EndReason::LinkFailed, Utc::now());
                    drop(inner);
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("cannot establish call: {err}")));
                    self.emit_call_state().await;
                    return Err(err.into());
                }
            }
        };

        let (answer, link_events) = match self.negotiation.accept_inbound(offer.clone()).await {
            Ok(result) => result,
            Err(err) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.machine.end_call(EndReason::LinkFailed, Utc::now());
                }
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("cannot establish call: {err}")));
                self.emit_call_state().await;
                return Err(err.into());
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.machine.complete_accept(offer, answer.clone())?;
        }
        self.watch_link(link_events).await;

        let payload = serde_json::to_string(&answer).unwrap_or_default();
        if !self
            .signaling
            .send(&Frame::Signal {
                peer: caller.clone(),
                kind: SignalKind::CallAccept,
                payload,
            })
            .await
        {
            debug!("signaling unavailable for call accept; relying on middleware delivery");
        }
        self.emit_call_state().await;
        Ok(())
    }

    pub async fn reject_call(&self) -> Result<()> {
        let caller = {
            let mut inner = self.inner.lock().await;
            let caller = inner.machine.reject()?;
            self.negotiation
                .discard_offer(&mut inner.pending_offers, &caller);
            caller
        };
        if !self
            .signaling
            .send(&Frame::Signal {
                peer: caller.clone(),
                kind: SignalKind::CallReject,
                payload: "{}".to_string(),
            })
            .await
        {
            warn!(peer = %caller, "could not deliver call rejection; signaling unavailable");
        }
        self.emit_call_state().await;
        Ok(())
    }

    pub async fn hang_up(&self) -> Result<()> {
        let (identity, invoker) = self.session().await?;
        let end = {
            let mut inner = self.inner.lock().await;
            inner.machine.end_call(EndReason::LocalHangup, Utc::now())
        }
        .ok_or(CallError::NoActiveCall)?;
        self.finish_call(&identity, Some(&invoker), end).await;
        Ok(())
    }

    pub async fn call_state(&self) -> CallState {
        self.inner.lock().await.machine.state()
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.inner.lock().await.machine.session().cloned()
    }

    pub async fn active_calls(&self) -> Result<Vec<CallInfo>> {
        let (identity, invoker) = self.session().await?;
        Ok(invoker.get_active_calls(&identity).await?)
    }

    // ---- raw audio streaming ----------------------------------------------

    pub async fn start_audio_stream(&self, target: &UserId, format: StreamFormat) -> bool {
        self.signaling
            .send(&Frame::StartStream {
                target: target.clone(),
                format,
            })
            .await
    }

    pub async fn stop_audio_stream(&self) -> bool {
        self.signaling.send(&Frame::StopStream).await
    }

    pub async fn send_audio_chunk(&self, chunk: Vec<u8>) -> bool {
        self.signaling.send_chunk(chunk).await
    }

    // ---- internals --------------------------------------------------------

    async fn session(&self) -> Result<(UserId, Arc<RpcInvoker>)> {
        let inner = self.inner.lock().await;
        let identity = inner
            .identity
            .clone()
            .ok_or_else(|| anyhow!("not logged in"))?;
        let invoker = inner
            .invoker
            .clone()
            .ok_or_else(|| anyhow!("not logged in"))?;
        Ok((identity, invoker))
    }

    async fn record_sent(&self, key: ConversationKey, from: UserId, content: MessageContent) {
        let message = CachedMessage {
            from,
            content,
            is_sent: true,
            timestamp: Utc::now(),
        };
        self.inner.lock().await.cache.insert(key, message);
    }

    async fn backfill_history(&self, identity: &UserId, invoker: &RpcInvoker) {
        let entries = match invoker.get_history(identity.as_str()).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "history backfill failed");
                return;
            }
        };
        let total = entries.len();
        let mut inner = self.inner.lock().await;
        for raw in entries {
            let Some(record) = HistoryRecord::parse(&raw) else {
                debug!(raw, "skipping unparseable history entry");
                continue;
            };
            let key = if record.is_group {
                ConversationKey::group(record.target.clone())
            } else if record.from == *identity {
                ConversationKey::user(record.target.clone())
            } else {
                ConversationKey::User(record.from.clone())
            };
            let message = CachedMessage {
                from: record.from.clone(),
                content: MessageContent::parse(&record.message),
                is_sent: record.from == *identity,
                timestamp: record.timestamp.unwrap_or_else(Utc::now),
            };
            inner.cache.insert(key, message);
        }
        debug!(entries = total, "history backfill complete");
    }

    async fn emit_call_state(&self) {
        let (state, peer) = {
            let inner = self.inner.lock().await;
            (
                inner.machine.state(),
                inner
                    .machine
                    .session()
                    .map(|session| session.remote_user.clone()),
            )
        };
        let _ = self.events.send(ClientEvent::CallStateChanged { state, peer });
    }

    async fn watch_link(&self, mut link_events: broadcast::Receiver<LinkEvent>) {
        let forward = self.inbound_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match link_events.recv().await {
                    Ok(event) => {
                        if forward.send(InboundEvent::Link(event)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "link event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.link_task.replace(task) {
            previous.abort();
        }
    }

    fn spawn_dispatcher(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<InboundEvent>) {
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                self.handle_inbound(event).await;
            }
        });
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Signaling(SignalingEvent::Frame(frame)) => self.handle_frame(frame).await,
            InboundEvent::Signaling(SignalingEvent::AudioChunk(chunk)) => {
                let _ = self.events.send(ClientEvent::AudioChunk { data: chunk });
            }
            InboundEvent::Signaling(SignalingEvent::Connected { identity }) => {
                debug!(identity = %identity, "signaling channel up");
            }
            InboundEvent::Signaling(SignalingEvent::Closed { will_retry }) => {
                debug!(will_retry, "signaling channel down");
            }
            InboundEvent::Push(push) => self.handle_push(push).await,
            InboundEvent::Poll(record) => self.handle_poll_record(record).await,
            InboundEvent::Link(event) => self.handle_link_event(event).await,
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Signal {
                peer,
                kind,
                payload,
            } => match kind {
                SignalKind::CallRequest | SignalKind::Offer => {
                    let offer = parse_call_request_offer(&payload);
                    self.handle_call_request(peer, None, offer, true).await;
                }
                SignalKind::CallAccept | SignalKind::Answer => {
                    self.handle_answer(peer, &payload).await;
                }
                SignalKind::CallReject => self.handle_reject(peer).await,
                SignalKind::CallEnd => self.handle_remote_end(Some(peer), None).await,
                SignalKind::IceCandidate => {
                    if let Err(err) = self
                        .negotiation
                        .add_remote_candidate(IceCandidate(payload))
                        .await
                    {
                        warn!(error = %err, "failed to apply remote candidate");
                    }
                }
                SignalKind::AudioChunk => self.handle_audio_message(peer, &payload).await,
            },
            Frame::IncomingCall { caller, call_id } => {
                self.handle_call_request(caller, Some(call_id), None, false)
                    .await;
            }
            Frame::StartStream { .. } | Frame::StopStream => {
                debug!("ignoring stream control frame from server");
            }
            Frame::ServerError { message } => {
                warn!(message = %message, "signaling server reported an error");
                let _ = self.events.send(ClientEvent::Error(message));
            }
        }
    }

    /// Shared entry for CALL_REQUEST frames, INCOMING_CALL pushes, and
    /// middleware call_started events. Only a signaling frame carries (or
    /// withdraws) an offer; the push variants fall back to the cached one.
    async fn handle_call_request(
        self: &Arc<Self>,
        caller: UserId,
        call_id: Option<CallId>,
        offer: Option<SessionDescription>,
        from_signal: bool,
    ) {
        let disposition = {
            let mut inner = self.inner.lock().await;
            let Some(identity) = inner.identity.clone() else {
                return;
            };
            let has_offer = match offer {
                Some(offer) => {
                    inner.pending_offers.put(caller.clone(), offer);
                    true
                }
                None if from_signal => {
                    // An offer-less CALL_REQUEST withdraws the stale cached
                    // offer rather than ringing with it.
                    self.negotiation
                        .discard_offer(&mut inner.pending_offers, &caller);
                    false
                }
                None => inner.pending_offers.get(&caller).is_some(),
            };
            inner
                .machine
                .on_call_request(caller, call_id, has_offer, &identity, Utc::now())
        };
        if let IncomingDisposition::Surface { caller, call_id } = disposition {
            let _ = self.events.send(ClientEvent::IncomingCall { caller, call_id });
            self.emit_call_state().await;
        }
    }

    async fn handle_answer(self: &Arc<Self>, from: UserId, payload: &str) {
        let answer = serde_json::from_str::<SessionDescription>(payload)
            .ok()
            .filter(|description| !description.sdp.is_empty());
        let Some(answer) = answer else {
            debug!(from = %from, "call accept without usable answer payload");
            return;
        };
        let accepted = {
            let mut inner = self.inner.lock().await;
            match inner.machine.session() {
                Some(session) if session.remote_user == from => {}
                _ => {
                    debug!(from = %from, "answer from unrelated peer ignored");
                    return;
                }
            }
            inner.machine.on_answer(answer.clone())
        };
        match accepted {
            Ok(_) => {
                if let Err(err) = self.negotiation.apply_answer(answer).await {
                    warn!(error = %err, "failed to apply remote answer");
                    self.fail_call("cannot establish call").await;
                    return;
                }
                self.emit_call_state().await;
            }
            Err(err) => debug!(from = %from, error = %err, "ignoring unexpected answer"),
        }
    }

    async fn handle_reject(self: &Arc<Self>, by: UserId) {
        let end = {
            let mut inner = self.inner.lock().await;
            self.negotiation
                .discard_offer(&mut inner.pending_offers, &by);
            let rejected_by_peer = inner
                .machine
                .session()
                .map(|session| session.remote_user == by)
                .unwrap_or(false);
            if rejected_by_peer {
                inner.machine.end_call(EndReason::RemoteRejected, Utc::now())
            } else {
                None
            }
        };
        let _ = self.events.send(ClientEvent::CallRejected { by });
        if let Some(end) = end {
            let (identity, invoker) = {
                let inner = self.inner.lock().await;
                (inner.identity.clone(), inner.invoker.clone())
            };
            if let Some(identity) = identity {
                self.finish_call(&identity, invoker.as_deref(), end).await;
            }
        }
    }

    async fn handle_remote_end(self: &Arc<Self>, from: Option<UserId>, call_id: Option<CallId>) {
        let (identity, invoker, end) = {
            let mut inner = self.inner.lock().await;
            if let Some(from) = &from {
                self.negotiation
                    .discard_offer(&mut inner.pending_offers, from);
            }
            let ends_active_session = inner
                .machine
                .session()
                .map(|session| {
                    let peer_matches = from
                        .as_ref()
                        .map(|from| session.remote_user == *from)
                        .unwrap_or(true);
                    if !peer_matches {
                        debug!("call end from unrelated peer ignored");
                        return false;
                    }
                    if let Some(call_id) = &call_id {
                        if session.call_id != *call_id {
                            debug!(
                                session_call = %session.call_id,
                                ended_call = %call_id,
                                "call ids differ; ending the active session anyway"
                            );
                        }
                    }
                    true
                })
                .unwrap_or(false);
            let end = if ends_active_session {
                inner.machine.end_call(EndReason::RemoteEnded, Utc::now())
            } else {
                None
            };
            (inner.identity.clone(), inner.invoker.clone(), end)
        };
        if let (Some(identity), Some(end)) = (identity, end) {
            self.finish_call(&identity, invoker.as_deref(), end).await;
        }
    }

    async fn handle_audio_message(self: &Arc<Self>, from: UserId, payload: &str) {
        let content = match MessageContent::parse(payload) {
            content @ MessageContent::Audio { .. } => content,
            _ => MessageContent::Audio {
                data: payload.to_string(),
                duration_ms: 0,
            },
        };
        if let MessageContent::Audio { data, .. } = &content {
            match STANDARD.decode(data.as_bytes()) {
                Ok(bytes) => {
                    let _ = self.events.send(ClientEvent::AudioChunk { data: bytes });
                }
                Err(err) => debug!(error = %err, "audio payload is not base64; skipping playback"),
            }
        }
        let key = ConversationKey::User(from.clone());
        let message = CachedMessage {
            from,
            content,
            is_sent: false,
            timestamp: Utc::now(),
        };
        let inserted = self
            .inner
            .lock()
            .await
            .cache
            .insert(key.clone(), message.clone());
        if inserted {
            let _ = self.events.send(ClientEvent::MessageReceived { key, message });
        }
    }

    async fn handle_push(self: &Arc<Self>, push: RpcPush) {
        match push {
            RpcPush::NewMessage {
                sender,
                receiver,
                content,
                timestamp,
            } => {
                let key = match receiver.strip_prefix('#') {
                    Some(group) => ConversationKey::group(group),
                    None => ConversationKey::User(sender.clone()),
                };
                self.ingest(key, sender, &content, timestamp).await;
            }
            RpcPush::CallStarted { call } => {
                self.handle_call_request(call.caller, Some(call.call_id), None, false)
                    .await;
            }
            RpcPush::CallEnded { call_id } => {
                self.handle_remote_end(None, Some(call_id)).await;
            }
        }
    }

    async fn handle_poll_record(self: &Arc<Self>, record: PendingRecord) {
        match record {
            PendingRecord::Direct { from, content } => {
                self.ingest(ConversationKey::User(from.clone()), from, &content, None)
                    .await;
            }
            PendingRecord::Group {
                group,
                from,
                content,
            } => {
                let own = { self.inner.lock().await.identity.clone() };
                if own.as_ref() == Some(&from) {
                    // Already cached when it was sent.
                    return;
                }
                self.ingest(ConversationKey::Group(group), from, &content, None)
                    .await;
            }
        }
    }

    async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let peer = {
                    let inner = self.inner.lock().await;
                    inner
                        .machine
                        .session()
                        .map(|session| session.remote_user.clone())
                };
                let Some(peer) = peer else { return };
                if !self
                    .signaling
                    .send(&Frame::Signal {
                        peer,
                        kind: SignalKind::IceCandidate,
                        payload: candidate.0,
                    })
                    .await
                {
                    debug!("signaling unavailable for local candidate");
                }
            }
            LinkEvent::StateChanged(LinkState::Connected) => {
                let connected = {
                    let mut inner = self.inner.lock().await;
                    inner.machine.on_link_connected(Utc::now())
                };
                if let Some((peer, role)) = connected {
                    self.record_call_started(peer, role).await;
                    self.emit_call_state().await;
                }
            }
            LinkEvent::StateChanged(state) if state.is_terminal() => {
                let (identity, invoker, end) = {
                    let mut inner = self.inner.lock().await;
                    (
                        inner.identity.clone(),
                        inner.invoker.clone(),
                        inner.machine.end_call(EndReason::LinkFailed, Utc::now()),
                    )
                };
                if let (Some(identity), Some(end)) = (identity, end) {
                    warn!(?state, "peer link reached a terminal state; tearing down call");
                    self.finish_call(&identity, invoker.as_deref(), end).await;
                }
            }
            LinkEvent::StateChanged(state) => debug!(?state, "peer link state changed"),
        }
    }

    async fn ingest(
        &self,
        key: ConversationKey,
        from: UserId,
        raw: &str,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let message = CachedMessage {
            from,
            content: MessageContent::parse(raw),
            is_sent: false,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };
        let inserted = self
            .inner
            .lock()
            .await
            .cache
            .insert(key.clone(), message.clone());
        if inserted {
            let _ = self.events.send(ClientEvent::MessageReceived { key, message });
        }
    }

    async fn record_call_started(&self, peer: UserId, role: CallRole) {
        let (identity, invoker) = {
            let inner = self.inner.lock().await;
            (inner.identity.clone(), inner.invoker.clone())
        };
        let Some(identity) = identity else { return };
        let content = MessageContent::CallLog {
            status: CallLogStatus::Started,
            duration_ms: 0,
        };
        self.record_sent(
            ConversationKey::User(peer.clone()),
            identity,
            content.clone(),
        )
        .await;
        // The caller announces the entry; the callee records it locally so
        // the log survives even when middleware delivery fails.
        if role == CallRole::Caller {
            if let Some(invoker) = invoker {
                if let Err(err) = invoker.send_message(peer.as_str(), &content.render()).await {
                    warn!(error = %err, "failed to deliver call-started log");
                }
            }
        }
    }

    /// Shared teardown for hangup, remote end, rejection, and link failure.
    async fn finish_call(&self, identity: &UserId, invoker: Option<&RpcInvoker>, end: CallEnd) {
        self.negotiation.close().await;
        {
            let mut inner = self.inner.lock().await;
            self.negotiation
                .discard_offer(&mut inner.pending_offers, &end.peer);
            if let Some(task) = inner.link_task.take() {
                task.abort();
            }
        }
        if end.notify_remote {
            if !self
                .signaling
                .send(&Frame::Signal {
                    peer: end.peer.clone(),
                    kind: SignalKind::CallEnd,
                    payload: String::new(),
                })
                .await
            {
                debug!("signaling unavailable for call end; relying on middleware");
            }
            if let Some(invoker) = invoker {
                if let Err(err) = invoker.end_call(&end.call_id).await {
                    warn!(error = %err, "middleware end_call failed");
                }
            }
        }
        if end.log_entry {
            let content = MessageContent::CallLog {
                status: CallLogStatus::Ended,
                duration_ms: end.duration_ms,
            };
            self.record_sent(
                ConversationKey::User(end.peer.clone()),
                identity.clone(),
                content.clone(),
            )
            .await;
            if let Some(invoker) = invoker {
                if let Err(err) = invoker.send_message(end.peer.as_str(), &content.render()).await {
                    warn!(error = %err, "failed to deliver call log");
                }
            }
        }
        let _ = self.events.send(ClientEvent::CallEnded {
            peer: end.peer.clone(),
            duration_ms: end.duration_ms,
        });
        self.emit_call_state().await;
    }

    async fn fail_call(self: &Arc<Self>, reason: &str) {
        let _ = self.events.send(ClientEvent::Error(reason.to_string()));
        let (identity, invoker, end) = {
            let mut inner = self.inner.lock().await;
            (
                inner.identity.clone(),
                inner.invoker.clone(),
                inner.machine.end_call(EndReason::LinkFailed, Utc::now()),
            )
        };
        if let (Some(identity), Some(end)) = (identity, end) {
            self.finish_call(&identity, invoker.as_deref(), end).await;
        }
    }
}

fn parse_call_request_offer(payload: &str) -> Option<SessionDescription> {
    if let Ok(request) = serde_json::from_str::<CallRequestPayload>(payload) {
        if request.offer.is_some() {
            return request.offer;
        }
    }
    serde_json::from_str::<SessionDescription>(payload)
        .ok()
        .filter(|description| !description.sdp.is_empty())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
