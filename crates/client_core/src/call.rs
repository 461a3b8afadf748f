use chrono::{DateTime, Utc};
use shared::{
    domain::{CallId, CallRole, UserId},
    protocol::SessionDescription,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    RingingIncoming,
    Negotiating,
    Connected,
    Ending,
    Ended,
}

/// The at-most-one active call. Dropping the session resets the machine to
/// Idle; `Ended` is therefore only ever observed inside [`CallEnd`].
#[derive(Debug, Clone)]
pub struct CallSession {
    pub remote_user: UserId,
    pub call_id: CallId,
    pub role: CallRole,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    end_logged: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("a call with {0} is already active")]
    Busy(UserId),
    #[error("no call is active")]
    NoActiveCall,
    #[error("no incoming call is ringing")]
    NotRinging,
    #[error("no outbound call is waiting for an answer")]
    NotCalling,
}

/// What the machine decided about an inbound call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingDisposition {
    /// Ring: surface the call to the UI collaborator.
    Surface { caller: UserId, call_id: CallId },
    /// The event carried no negotiable offer; wait for a follow-up frame.
    AwaitOffer,
    /// A call is already active. Policy: log and ignore, no busy signal.
    IgnoredBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteEnded,
    RemoteRejected,
    LinkFailed,
}

impl EndReason {
    /// Rejected calls never rang through, so they produce no call-log entry.
    fn logs_call(self) -> bool {
        !matches!(self, Self::RemoteRejected)
    }
}

/// Summary of a finished session, produced exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnd {
    pub peer: UserId,
    pub call_id: CallId,
    pub duration_ms: u64,
    /// Whether the remote side still needs a CALL_END notification.
    pub notify_remote: bool,
    /// Whether an end-of-call log entry should be recorded. Guarded by the
    /// per-session end-logged flag so racing local and remote teardown can
    /// never log twice.
    pub log_entry: bool,
    pub was_connected: bool,
}

/// Pure transition core of the call lifecycle. All I/O side effects are
/// executed by the dispatcher from the values these methods return.
#[derive(Debug, Default)]
pub struct CallMachine {
    session: Option<CallSession>,
}

impl CallMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state(), CallState::Idle | CallState::Ended)
    }

    /// Caller side: Idle -> Calling. Rejected outright while any call is
    /// active; the existing session is left untouched.
    pub fn start_call(
        &mut self,
        local: &UserId,
        peer: UserId,
        offer: SessionDescription,
        now: DateTime<Utc>,
    ) -> Result<CallId, CallError> {
        if let Some(session) = &self.session {
            return Err(CallError::Busy(session.remote_user.clone()));
        }
        let call_id = CallId::generate(local, &peer, now.timestamp_millis());
        info!(peer = %peer, call_id = %call_id, "starting outbound call");
        self.session = Some(CallSession {
            remote_user: peer,
            call_id: call_id.clone(),
            role: CallRole::Caller,
            state: CallState::Calling,
            started_at: now,
            connected_at: None,
            offer: Some(offer),
            answer: None,
            end_logged: false,
        });
        Ok(call_id)
    }

    /// A middleware- or remote-issued call id is authoritative over the
    /// locally generated one.
    pub fn adopt_call_id(&mut self, call_id: CallId) {
        if let Some(session) = &mut self.session {
            debug!(old = %session.call_id, new = %call_id, "adopting remote call id");
            session.call_id = call_id;
        }
    }

    /// Callee side: Idle -> RingingIncoming, provided the event carries a
    /// negotiable offer. The offer itself stays in the pending-offer store
    /// until the negotiation coordinator consumes it on accept.
    pub fn on_call_request(
        &mut self,
        caller: UserId,
        call_id: Option<CallId>,
        has_offer: bool,
        local: &UserId,
        now: DateTime<Utc>,
    ) -> IncomingDisposition {
        if self.session.is_some() {
            warn!(caller = %caller, "ignoring inbound call request while a call is active");
            return IncomingDisposition::IgnoredBusy;
        }
        if !has_offer {
            debug!(caller = %caller, "inbound call event without offer; waiting for signaling payload");
            return IncomingDisposition::AwaitOffer;
        }
        let call_id =
            call_id.unwrap_or_else(|| CallId::generate(&caller, local, now.timestamp_millis()));
        info!(caller = %caller, call_id = %call_id, "incoming call ringing");
        self.session = Some(CallSession {
            remote_user: caller.clone(),
            call_id: call_id.clone(),
            role: CallRole::Callee,
            state: CallState::RingingIncoming,
            started_at: now,
            connected_at: None,
            offer: None,
            answer: None,
            end_logged: false,
        });
        IncomingDisposition::Surface { caller, call_id }
    }

    /// First half of accept: validates the state and names the caller whose
    /// cached offer must be consumed.
    pub fn begin_accept(&self) -> Result<UserId, CallError> {
        match &self.session {
            Some(session) if session.state == CallState::RingingIncoming => {
                Ok(session.remote_user.clone())
            }
            _ => Err(CallError::NotRinging),
        }
    }

    /// Second half of accept: RingingIncoming -> Negotiating with the
    /// consumed offer and freshly created answer recorded on the session.
    pub fn complete_accept(
        &mut self,
        offer: SessionDescription,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|session| session.state == CallState::RingingIncoming)
            .ok_or(CallError::NotRinging)?;
        session.offer = Some(offer);
        session.answer = Some(answer);
        session.state = CallState::Negotiating;
        Ok(())
    }

    /// RingingIncoming -> Ended. Returns the caller to notify.
    pub fn reject(&mut self) -> Result<UserId, CallError> {
        match self.session.take() {
            Some(session) if session.state == CallState::RingingIncoming => {
                info!(caller = %session.remote_user, "rejecting incoming call");
                Ok(session.remote_user)
            }
            other => {
                self.session = other;
                Err(CallError::NotRinging)
            }
        }
    }

    /// Caller side: Calling -> Negotiating on CALL_ACCEPT/ANSWER.
    pub fn on_answer(&mut self, answer: SessionDescription) -> Result<UserId, CallError> {
        let session = self
            .session
            .as_mut()
            .filter(|session| session.state == CallState::Calling)
            .ok_or(CallError::NotCalling)?;
        session.answer = Some(answer);
        session.state = CallState::Negotiating;
        Ok(session.remote_user.clone())
    }

    /// Negotiating -> Connected when the link comes up. Idempotent: repeat
    /// reports and reports in any other state return None.
    pub fn on_link_connected(&mut self, now: DateTime<Utc>) -> Option<(UserId, CallRole)> {
        let session = self.session.as_mut()?;
        if session.state != CallState::Negotiating {
            return None;
        }
        session.state = CallState::Connected;
        session.connected_at = Some(now);
        info!(peer = %session.remote_user, "call connected");
        Some((session.remote_user.clone(), session.role))
    }

    /// Any non-Idle state -> Ending -> Ended, then reset to Idle. Duration
    /// is computed here, once, as `now - connected_at` (zero when the call
    /// never connected). Returns None when no session is active, which is
    /// what makes racing local hangup and remote CALL_END log only once.
    pub fn end_call(&mut self, reason: EndReason, now: DateTime<Utc>) -> Option<CallEnd> {
        let mut session = self.session.take()?;
        session.state = CallState::Ending;
        let duration_ms = session
            .connected_at
            .map(|connected| (now - connected).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let log_entry = !session.end_logged && reason.logs_call();
        session.end_logged = true;
        session.state = CallState::Ended;
        info!(
            peer = %session.remote_user,
            call_id = %session.call_id,
            ?reason,
            duration_ms,
            "call ended"
        );
        Some(CallEnd {
            peer: session.remote_user,
            call_id: session.call_id,
            duration_ms,
            notify_remote: matches!(reason, EndReason::LocalHangup),
            log_entry,
            was_connected: session.connected_at.is_some(),
        })
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
