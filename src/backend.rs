//! Typed client for the call backend's request/response surface.
//!
//! Everything here is a plain request/response exchange: call
//! announcement and accept/reject/end, the recording sink's trickle-free
//! offer/answer, the pending/history listings an agent UI refreshes, and
//! the one-time-code login that issues the bearer credential attached to
//! subsequent requests.

use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::net::{HttpClient, HttpRequest, HttpResponse};
use crate::types::call::{CallRole, EndpointId, SessionId};

#[derive(Serialize)]
struct NotifyCallBody<'a> {
    caller_name: &'a str,
    caller_id: &'a EndpointId,
    session_id: &'a SessionId,
}

#[derive(Serialize)]
struct RespondCallBody<'a> {
    session_id: &'a SessionId,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<&'a EndpointId>,
}

#[derive(Serialize)]
struct EndCallBody<'a> {
    session_id: &'a SessionId,
}

#[derive(Serialize)]
struct RecordOfferBody<'a> {
    sdp: &'a str,
    #[serde(rename = "type")]
    sdp_type: &'a str,
    session_id: &'a SessionId,
    role: CallRole,
}

/// The recording sink's answer to a mirrored-media offer.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Serialize)]
struct RecordStopBody<'a> {
    session_id: &'a SessionId,
    role: CallRole,
}

/// One entry of the pending-call listing. `caller_id` is the counterpart
/// endpoint the agent learns from the pending-call assignment, when the
/// backend exposes it.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingCall {
    pub id: Option<i64>,
    pub session_id: SessionId,
    pub caller_name: String,
    #[serde(default)]
    pub caller_id: Option<EndpointId>,
    pub start_time: NaiveDateTime,
}

/// One entry of the call-history listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CallRecord {
    pub id: Option<i64>,
    pub session_id: SessionId,
    pub caller_name: String,
    pub status: String,
    pub start_time: NaiveDateTime,
    pub duration: Option<i64>,
    pub agent_id: Option<EndpointId>,
}

#[derive(Serialize)]
struct RequestOtpBody<'a> {
    username: &'a str,
}

#[derive(Serialize)]
struct VerifyOtpBody<'a> {
    username: &'a str,
    otp: &'a str,
}

/// Bearer credential issued by the one-time-code login.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub token_type: String,
}

pub struct BackendClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    bearer: RwLock<Option<String>>,
}

impl BackendClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            bearer: RwLock::new(None),
        }
    }

    /// Attach (or clear) the bearer credential sent with every request.
    pub fn set_bearer(&self, token: Option<String>) {
        *self.bearer.write().unwrap() = token;
    }

    /// Announce a new pending call keyed by `session_id`.
    pub async fn notify_call(
        &self,
        caller_name: &str,
        caller_id: &EndpointId,
        session_id: &SessionId,
    ) -> Result<(), anyhow::Error> {
        self.post_json(
            "/api/call/notify",
            &NotifyCallBody {
                caller_name,
                caller_id,
                session_id,
            },
        )
        .await?;
        Ok(())
    }

    /// Accept or reject a pending call.
    pub async fn respond_call(
        &self,
        session_id: &SessionId,
        accept: bool,
        agent_id: Option<&EndpointId>,
    ) -> Result<(), anyhow::Error> {
        self.post_json(
            "/api/call/respond",
            &RespondCallBody {
                session_id,
                action: if accept { "accept" } else { "reject" },
                agent_id,
            },
        )
        .await?;
        Ok(())
    }

    /// Mark the session ended; the backend broadcasts `call_ended` to the
    /// session over the signaling relay. Best-effort at hangup time.
    pub async fn end_call(&self, session_id: &SessionId) -> Result<(), anyhow::Error> {
        self.post_json("/api/call/end", &EndCallBody { session_id })
            .await?;
        Ok(())
    }

    /// The synchronous offer/answer exchange with the recording sink.
    pub async fn record_offer(
        &self,
        sdp: &str,
        session_id: &SessionId,
        role: CallRole,
    ) -> Result<RecordAnswer, anyhow::Error> {
        let response = self
            .post_json(
                "/api/record/offer",
                &RecordOfferBody {
                    sdp,
                    sdp_type: "offer",
                    session_id,
                    role,
                },
            )
            .await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Tell the sink to stop recording. Best-effort, response ignored.
    pub async fn record_stop(
        &self,
        session_id: &SessionId,
        role: CallRole,
    ) -> Result<(), anyhow::Error> {
        self.post_json("/api/record/stop", &RecordStopBody { session_id, role })
            .await?;
        Ok(())
    }

    /// The current pending-call set. Refreshed by agent UIs on
    /// `pending_update` notices.
    pub async fn pending_calls(&self) -> Result<Vec<PendingCall>, anyhow::Error> {
        let response = self.get("/api/calls/pending").await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Most recent call records, newest first.
    pub async fn call_history(&self, limit: usize) -> Result<Vec<CallRecord>, anyhow::Error> {
        let response = self
            .get(&format!("/api/calls/history?limit={limit}"))
            .await?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Ask for a one-time code to be delivered out of band.
    pub async fn request_otp(&self, username: &str) -> Result<(), anyhow::Error> {
        self.post_json("/api/auth/request-otp", &RequestOtpBody { username })
            .await?;
        Ok(())
    }

    /// Exchange the one-time code for a bearer credential. The credential
    /// is stored on this client and attached to subsequent requests.
    pub async fn verify_otp(&self, username: &str, otp: &str) -> Result<AuthToken, anyhow::Error> {
        let response = self
            .post_json("/api/auth/verify-otp", &VerifyOtpBody { username, otp })
            .await?;
        let token: AuthToken = serde_json::from_slice(&response.body)?;
        self.set_bearer(Some(token.access_token.clone()));
        Ok(token)
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse, anyhow::Error> {
        let request = HttpRequest::post(format!("{}{}", self.base_url, path))
            .with_header("Content-Type", "application/json")
            .with_body(serde_json::to_vec(body)?);
        self.execute(request).await
    }

    async fn get(&self, path: &str) -> Result<HttpResponse, anyhow::Error> {
        let request = HttpRequest::get(format!("{}{}", self.base_url, path));
        self.execute(request).await
    }

    async fn execute(&self, mut request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let bearer = self.bearer.read().unwrap().clone();
        if let Some(token) = bearer {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }
        debug!("{} {}", request.method, request.url);
        let response = self.http.execute(request).await?;
        if !response.is_success() {
            return Err(anyhow::anyhow!(
                "backend returned status {}",
                response.status_code
            ));
        }
        Ok(response)
    }
}
