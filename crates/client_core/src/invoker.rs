use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use shared::{
    domain::{CallId, UserId},
    protocol::{CallInfo, RpcPush, RpcReply, RpcRequest},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Header that carries the caller identity when it cannot travel in the
/// proxy address itself.
pub const CONTEXT_HEADER: &str = "x-chat-user";

/// One addressing scheme for reaching the middleware. Identity propagation
/// through the middleware is unreliable in this deployment, so every remote
/// call walks an ordered plan of these instead of trusting a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Proxy with the identity embedded as a query parameter.
    QueryProxy,
    /// Plain proxy with an explicit per-call context map.
    ExplicitContext,
    /// Plain proxy relying on the connection-wide context set once on the
    /// underlying client.
    ImplicitContext,
    /// Plain proxy, no identity context at all.
    Plain,
}

/// The ordered fallback plan. The trailing QueryProxy entry is the
/// last-resort retry; the runner skips it when the query proxy already
/// failed an actual invocation at step one.
pub const ROUTE_PLAN: [Route; 5] = [
    Route::QueryProxy,
    Route::ExplicitContext,
    Route::ImplicitContext,
    Route::Plain,
    Route::QueryProxy,
];

#[derive(Debug, Clone)]
pub struct Attempt {
    pub route: Route,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum RpcError {
    /// The proxy itself could not be obtained; no invocation happened.
    #[error("proxy unavailable: {0}")]
    ProxyUnavailable(String),
    /// Attaching the identity context failed before the call went out.
    #[error("identity context attachment failed: {0}")]
    ContextAttachment(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected by middleware: {0}")]
    Rejected(String),
    #[error("all transport routes exhausted for {op} ({} attempts)", .attempts.len())]
    Exhausted { op: &'static str, attempts: Vec<Attempt> },
}

impl RpcError {
    /// Whether the error happened after an invocation actually went out on
    /// the wire (as opposed to failing to obtain the proxy at all).
    fn invocation_attempted(&self) -> bool {
        !matches!(self, Self::ProxyUnavailable(_))
    }
}

/// A middleware connection able to issue one call over one addressing
/// scheme. Acquisition and context failures surface as the corresponding
/// [`RpcError`] variants.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn call(&self, route: Route, request: &RpcRequest) -> Result<RpcReply, RpcError>;
}

/// Evaluates the ordered route plan for every outbound call.
///
/// Each step's failure is non-fatal; only exhaustion of the whole plan
/// surfaces an error, and that error is the single one callers ever see.
pub struct RpcInvoker {
    channel: Arc<dyn RpcChannel>,
}

impl RpcInvoker {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    pub async fn invoke(&self, request: &RpcRequest) -> Result<RpcReply, RpcError> {
        let op = request.op_name();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut query_invoked = false;

        for (index, route) in ROUTE_PLAN.iter().copied().enumerate() {
            let last_resort = index == ROUTE_PLAN.len() - 1;
            if last_resort && query_invoked {
                debug!(op, "skipping last-resort query retry; query proxy already invoked");
                break;
            }
            match self.channel.call(route, request).await {
                Ok(reply) => {
                    if !attempts.is_empty() {
                        info!(op, ?route, fallbacks = attempts.len(), "rpc succeeded after fallback");
                    }
                    return Ok(reply);
                }
                Err(err) => {
                    if route == Route::QueryProxy && err.invocation_attempted() {
                        query_invoked = true;
                    }
                    warn!(op, ?route, error = %err, "rpc route failed, falling back");
                    attempts.push(Attempt {
                        route,
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(RpcError::Exhausted { op, attempts })
    }

    pub async fn send_message(&self, receiver: &str, content: &str) -> Result<(), RpcError> {
        let request = RpcRequest::SendMessage {
            receiver: receiver.to_string(),
            content: content.to_string(),
        };
        self.expect_ack(request).await
    }

    pub async fn send_audio(&self, receiver: &str, payload_b64: &str) -> Result<(), RpcError> {
        let request = RpcRequest::SendAudio {
            receiver: receiver.to_string(),
            payload_b64: payload_b64.to_string(),
        };
        self.expect_ack(request).await
    }

    pub async fn start_call(&self, caller: &UserId, callee: &UserId) -> Result<CallInfo, RpcError> {
        let request = RpcRequest::StartCall {
            caller: caller.clone(),
            callee: callee.clone(),
        };
        match self.invoke(&request).await? {
            RpcReply::CallStarted { call } => Ok(call),
            other => Err(unexpected_reply("start_call", &other)),
        }
    }

    pub async fn end_call(&self, call_id: &CallId) -> Result<(), RpcError> {
        let request = RpcRequest::EndCall {
            call_id: call_id.clone(),
        };
        self.expect_ack(request).await
    }

    pub async fn get_active_calls(&self, user_id: &UserId) -> Result<Vec<CallInfo>, RpcError> {
        let request = RpcRequest::GetActiveCalls {
            user_id: user_id.clone(),
        };
        match self.invoke(&request).await? {
            RpcReply::ActiveCalls { calls } => Ok(calls),
            other => Err(unexpected_reply("get_active_calls", &other)),
        }
    }

    pub async fn get_history(&self, target: &str) -> Result<Vec<String>, RpcError> {
        let request = RpcRequest::GetHistory {
            target: target.to_string(),
        };
        match self.invoke(&request).await? {
            RpcReply::History { entries } => Ok(entries),
            other => Err(unexpected_reply("get_history", &other)),
        }
    }

    pub async fn subscribe(&self, user_id: &UserId, subscriber_id: &str) -> Result<(), RpcError> {
        let request = RpcRequest::Subscribe {
            user_id: user_id.clone(),
            subscriber_id: subscriber_id.to_string(),
        };
        self.expect_ack(request).await
    }

    async fn expect_ack(&self, request: RpcRequest) -> Result<(), RpcError> {
        match self.invoke(&request).await? {
            RpcReply::Ack => Ok(()),
            other => Err(unexpected_reply(request.op_name(), &other)),
        }
    }
}

fn unexpected_reply(op: &str, reply: &RpcReply) -> RpcError {
    RpcError::Rejected(format!("unexpected middleware reply to {op}: {reply:?}"))
}

/// RPC-over-HTTP middleware channel.
///
/// The four addressing schemes map onto HTTP as: identity query parameter,
/// per-request context header, a client built once with the identity as a
/// default header, and a bare client.
pub struct HttpRpcChannel {
    rpc_url: String,
    identity: UserId,
    plain: reqwest::Client,
    /// Client carrying the connection-wide identity context. Construction
    /// can fail for identities that are not valid header values; the
    /// failure is deferred to the ImplicitContext route.
    contextual: Option<reqwest::Client>,
}

impl HttpRpcChannel {
    pub fn new(rpc_url: impl Into<String>, identity: UserId) -> Self {
        let contextual = HeaderValue::from_str(identity.as_str())
            .ok()
            .and_then(|value| {
                let mut headers = HeaderMap::new();
                headers.insert(CONTEXT_HEADER, value);
                reqwest::Client::builder()
                    .default_headers(headers)
                    .build()
                    .ok()
            });
        if contextual.is_none() {
            warn!(identity = %identity, "implicit identity context unavailable for this identity");
        }
        Self {
            rpc_url: rpc_url.into(),
            identity,
            plain: reqwest::Client::new(),
            contextual,
        }
    }

    fn query_url(&self) -> Result<Url, RpcError> {
        Url::parse_with_params(&self.rpc_url, &[("user", self.identity.as_str())])
            .map_err(|err| RpcError::ProxyUnavailable(err.to_string()))
    }

    fn plain_url(&self) -> Result<Url, RpcError> {
        Url::parse(&self.rpc_url).map_err(|err| RpcError::ProxyUnavailable(err.to_string()))
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        url: Url,
        request: &RpcRequest,
        context: Option<HeaderValue>,
    ) -> Result<RpcReply, RpcError> {
        let mut builder = client.post(url).json(request);
        if let Some(value) = context {
            builder = builder.header(CONTEXT_HEADER, value);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(RpcError::Rejected(format!(
                "middleware returned {}",
                response.status()
            )));
        }
        let reply: RpcReply = response
            .json()
            .await
            .map_err(|err| RpcError::Transport(format!("invalid middleware reply: {err}")))?;
        match reply {
            RpcReply::Error(api) => Err(RpcError::Rejected(api.message)),
            reply => Ok(reply),
        }
    }
}

#[async_trait]
impl RpcChannel for HttpRpcChannel {
    async fn call(&self, route: Route, request: &RpcRequest) -> Result<RpcReply, RpcError> {
        match route {
            Route::QueryProxy => {
                let url = self.query_url()?;
                self.post(&self.plain, url, request, None).await
            }
            Route::ExplicitContext => {
                let value = HeaderValue::from_str(self.identity.as_str())
                    .map_err(|err| RpcError::ContextAttachment(err.to_string()))?;
                let url = self.plain_url()?;
                self.post(&self.plain, url, request, Some(value)).await
            }
            Route::ImplicitContext => {
                let client = self.contextual.as_ref().ok_or_else(|| {
                    RpcError::ContextAttachment("implicit identity context unavailable".to_string())
                })?;
                let url = self.plain_url()?;
                self.post(client, url, request, None).await
            }
            Route::Plain => {
                let url = self.plain_url()?;
                self.post(&self.plain, url, request, None).await
            }
        }
    }
}

/// Reads middleware push events off the subscription socket and forwards
/// them to the dispatcher. Ends quietly when the socket closes; redundant
/// delivery over signaling and polling covers the gap.
pub async fn spawn_push_reader(
    events_url: &str,
    identity: &UserId,
    forward: mpsc::Sender<RpcPush>,
) -> Result<JoinHandle<()>, RpcError> {
    let url = Url::parse_with_params(events_url, &[("user", identity.as_str())])
        .map_err(|err| RpcError::ProxyUnavailable(err.to_string()))?;
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| RpcError::Transport(err.to_string()))?;
    let (_, mut reader) = stream.split();
    let identity = identity.clone();

    Ok(tokio::spawn(async move {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<RpcPush>(&text) {
                    Ok(push) => {
                        if forward.send(push).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "invalid push event"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "push socket receive failed");
                    break;
                }
            }
        }
        debug!(identity = %identity, "push socket closed");
    }))
}

#[cfg(test)]
#[path = "tests/invoker_tests.rs"]
mod tests;
