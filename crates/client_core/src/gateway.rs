use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use reqwest::{
    multipart::{Form, Part},
    Client, Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::CredentialPair,
    protocol::{ApiEnvelope, RefreshRequest},
};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialStore,
    error::{ClientError, Result},
};

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<MultipartField>),
}

/// Owned multipart field, rebuilt into a form on every attempt so a request
/// can be replayed after a refresh.
#[derive(Debug, Clone)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime_type: Option<String>,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    anonymous: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            anonymous: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn json(mut self, body: &impl Serialize) -> Result<Self> {
        self.body = RequestBody::Json(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn query(mut self, params: &impl Serialize) -> Result<Self> {
        let Value::Object(map) = serde_json::to_value(params)? else {
            return Ok(self);
        };
        for (key, value) in map {
            let value = match value {
                Value::Null => continue,
                Value::String(text) => text,
                other => other.to_string(),
            };
            self.query.push((key, value));
        }
        Ok(self)
    }

    pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }

    /// Marks a request made before any session exists (login, register). A
    /// 401 on it is a plain server error, not an expired session.
    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Authorization could not be recovered; the credential pair is already
    /// cleared and the rest of the session must be torn down.
    Expired,
}

#[derive(Debug, Clone)]
enum RefreshOutcome {
    Refreshed(String),
    Failed,
    /// The task driving the refresh went away before finishing.
    Abandoned,
}

#[derive(Default)]
struct RefreshQueue {
    parked: VecDeque<oneshot::Sender<(RefreshOutcome, ReplayTurn)>>,
}

/// A request's place in the replay order after a refresh. The request waits
/// for its predecessor's replay to settle; dropping the turn releases the
/// next one.
#[derive(Default)]
struct ReplayTurn {
    after: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

impl ReplayTurn {
    async fn wait(&mut self) {
        if let Some(after) = self.after.take() {
            let _ = after.await;
        }
    }
}

impl Drop for ReplayTurn {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }
}

enum RefreshState {
    Idle,
    InFlight(RefreshQueue),
}

struct RefreshControl {
    state: RefreshState,
    /// Access credential minted by the most recent successful refresh.
    last_minted: Option<String>,
}

enum Attempt {
    Done(String),
    Unauthorized(String),
}

enum RefreshRole {
    Leader,
    Parked(oneshot::Receiver<(RefreshOutcome, ReplayTurn)>),
    Superseded(String),
}

pub struct RequestGateway {
    http: Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
    refresh: Mutex<RefreshControl>,
    session_events: broadcast::Sender<SessionSignal>,
}

impl RequestGateway {
    pub fn new(base_url: impl Into<String>, credentials: Arc<CredentialStore>) -> Arc<Self> {
        Self::with_client(Client::new(), base_url, credentials)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        credentials: Arc<CredentialStore>,
    ) -> Arc<Self> {
        let (session_events, _) = broadcast::channel(16);
        Arc::new(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            refresh: Mutex::new(RefreshControl {
                state: RefreshState::Idle,
                last_minted: None,
            }),
            session_events,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn subscribe_session(&self) -> broadcast::Receiver<SessionSignal> {
        self.session_events.subscribe()
    }

    pub fn reset_session(&self) {
        self.lock_refresh().last_minted = None;
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        let body = self.send(request).await?;
        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
        Ok(envelope.data)
    }

    /// Sends `request` with the current access credential. An authorization
    /// failure joins the refresh protocol and the request is replayed at most
    /// once.
    pub async fn send(&self, request: &ApiRequest) -> Result<String> {
        let credential = self.credentials.access_credential().await?;
        let body = match self.execute(request, credential.as_deref()).await? {
            Attempt::Done(body) => return Ok(body),
            Attempt::Unauthorized(body) => body,
        };

        if request.anonymous {
            return Err(ClientError::Server {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                body,
            });
        }

        debug!(path = %request.path, "gateway: authorization rejected, recovering credential");
        let (fresh, mut turn) = self.recover_credential(credential.as_deref()).await?;

        turn.wait().await;
        let replayed = self.execute(request, Some(&fresh)).await;
        drop(turn);

        match replayed? {
            Attempt::Done(body) => Ok(body),
            Attempt::Unauthorized(_) => {
                warn!(
                    path = %request.path,
                    "gateway: request rejected again after refresh, ending session"
                );
                self.expire_session().await;
                Err(ClientError::Unauthorized)
            }
        }
    }

    async fn recover_credential(&self, stale: Option<&str>) -> Result<(String, ReplayTurn)> {
        loop {
            let role = {
                let mut guard = self.lock_refresh();
                let control = &mut *guard;
                if let RefreshState::InFlight(queue) = &mut control.state {
                    let (tx, rx) = oneshot::channel();
                    queue.parked.push_back(tx);
                    RefreshRole::Parked(rx)
                } else if let Some(minted) = control
                    .last_minted
                    .as_ref()
                    .filter(|minted| Some(minted.as_str()) != stale)
                {
                    // A refresh already completed after this request was stamped.
                    RefreshRole::Superseded(minted.clone())
                } else {
                    control.state = RefreshState::InFlight(RefreshQueue::default());
                    RefreshRole::Leader
                }
            };

            match role {
                RefreshRole::Superseded(token) => return Ok((token, ReplayTurn::default())),
                RefreshRole::Parked(rx) => match rx.await {
                    Ok((RefreshOutcome::Refreshed(token), turn)) => return Ok((token, turn)),
                    Ok((RefreshOutcome::Failed, _)) => return Err(ClientError::Unauthorized),
                    Ok((RefreshOutcome::Abandoned, _)) | Err(_) => continue,
                },
                RefreshRole::Leader => {
                    let guard = RefreshGuard {
                        gateway: self,
                        finished: false,
                    };
                    let outcome = self.run_refresh().await;
                    if matches!(outcome, RefreshOutcome::Failed) {
                        self.expire_session().await;
                    }
                    let turn = guard.finish(outcome.clone());
                    return match outcome {
                        RefreshOutcome::Refreshed(token) => Ok((token, turn)),
                        _ => Err(ClientError::Unauthorized),
                    };
                }
            }
        }
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        let refresh_token = match self.credentials.refresh_credential().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("gateway: no refresh credential stored");
                return RefreshOutcome::Failed;
            }
            Err(err) => {
                error!("gateway: failed to read refresh credential: {err}");
                return RefreshOutcome::Failed;
            }
        };

        let response = self
            .http
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await;

        let pair = match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<ApiEnvelope<CredentialPair>>().await {
                    Ok(envelope) => envelope.data,
                    Err(err) => {
                        error!("gateway: malformed refresh response: {err}");
                        return RefreshOutcome::Failed;
                    }
                }
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "gateway: refresh rejected");
                return RefreshOutcome::Failed;
            }
            Err(err) => {
                warn!("gateway: refresh call failed: {err}");
                return RefreshOutcome::Failed;
            }
        };

        if let Err(err) = self.credentials.save_credentials(&pair).await {
            error!("gateway: failed to persist refreshed credentials: {err}");
            return RefreshOutcome::Failed;
        }

        self.lock_refresh().last_minted = Some(pair.access_token.clone());
        info!("gateway: access credential refreshed");
        RefreshOutcome::Refreshed(pair.access_token)
    }

    /// Releases every parked request, chaining their replay turns in parking
    /// order behind the leader's, and returns the leader's turn.
    fn finish_refresh(&self, outcome: RefreshOutcome) -> ReplayTurn {
        let parked = {
            let mut control = self.lock_refresh();
            match std::mem::replace(&mut control.state, RefreshState::Idle) {
                RefreshState::InFlight(queue) => queue.parked,
                RefreshState::Idle => VecDeque::new(),
            }
        };

        if !parked.is_empty() {
            debug!(parked = parked.len(), "gateway: releasing parked requests");
        }
        let (leader_release, mut after) = oneshot::channel();
        for waiter in parked {
            let (release, next_after) = oneshot::channel();
            let turn = ReplayTurn {
                after: Some(std::mem::replace(&mut after, next_after)),
                release: Some(release),
            };
            // A waiter that went away hands its turn straight back; dropping
            // it releases the one behind.
            let _ = waiter.send((outcome.clone(), turn));
        }
        ReplayTurn {
            after: None,
            release: Some(leader_release),
        }
    }

    async fn expire_session(&self) {
        if let Err(err) = self.credentials.clear().await {
            error!("gateway: failed to clear credentials: {err}");
        }
        self.lock_refresh().last_minted = None;
        let _ = self.session_events.send(SessionSignal::Expired);
    }

    async fn execute(&self, request: &ApiRequest, credential: Option<&str>) -> Result<Attempt> {
        let mut builder = self
            .http
            .request(request.method.clone(), format!("{}{}", self.base_url, request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = credential {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))?;

        if status == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized(body));
        }
        if !status.is_success() {
            return Err(ClientError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Attempt::Done(body))
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshControl> {
        self.refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the refresh state to idle if the leader is dropped mid-refresh,
/// handing the parked requests back so one of them can lead instead.
struct RefreshGuard<'a> {
    gateway: &'a RequestGateway,
    finished: bool,
}

impl RefreshGuard<'_> {
    fn finish(mut self, outcome: RefreshOutcome) -> ReplayTurn {
        self.finished = true;
        self.gateway.finish_refresh(outcome)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.gateway.finish_refresh(RefreshOutcome::Abandoned);
        }
    }
}

fn build_form(fields: &[MultipartField]) -> Result<Form> {
    let mut form = Form::new();
    for field in fields {
        form = match field {
            MultipartField::Text { name, value } => form.text(name.clone(), value.clone()),
            MultipartField::File {
                name,
                file_name,
                mime_type,
                data,
            } => {
                let mut part = Part::bytes(data.clone()).file_name(file_name.clone());
                if let Some(mime_type) = mime_type.as_deref().filter(|m| !m.is_empty()) {
                    part = part.mime_str(mime_type)?;
                }
                form.part(name.clone(), part)
            }
        };
    }
    Ok(form)
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
