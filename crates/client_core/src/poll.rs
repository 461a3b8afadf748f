use std::time::Duration;

use serde::Deserialize;
use shared::{domain::UserId, protocol::PendingRecord};
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::InboundEvent;

#[derive(Debug, Deserialize)]
struct PendingMessagesResponse {
    success: bool,
    #[serde(default)]
    messages: Vec<String>,
}

/// Handle of the running poll task. This interval is the one component that
/// must be torn down explicitly on logout, or it outlives the session.
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Polls the gateway's pending-message endpoint on a fixed interval and
/// forwards parsed records to the dispatcher, which routes them through the
/// same cache insertion contract as every other transport.
pub(crate) fn spawn_poll_loop(
    http: reqwest::Client,
    api_url: String,
    username: UserId,
    period: Duration,
    events: mpsc::Sender<InboundEvent>,
) -> PollHandle {
    let task = tokio::spawn(async move {
        let url = format!("{api_url}/messages/pending/{username}");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let body = match http.get(&url).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => response.json::<PendingMessagesResponse>().await,
                    Err(err) => {
                        warn!(error = %err, "pending-message poll rejected");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(error = %err, "pending-message poll failed");
                    continue;
                }
            };
            let body = match body {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "invalid pending-message response");
                    continue;
                }
            };
            if !body.success {
                continue;
            }
            for raw in body.messages {
                match PendingRecord::parse(&raw) {
                    Ok(record) => {
                        if events.send(InboundEvent::Poll(record)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => debug!(error = %err, raw, "skipping unparseable pending record"),
                }
            }
        }
    });
    PollHandle { task }
}
