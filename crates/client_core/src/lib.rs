use std::sync::{Arc, Mutex, MutexGuard, Weak};

use shared::{
    domain::{Attachment, CredentialPair, Identity, UserId},
    protocol::{AuthResponse, RegisterRequest},
};
use storage::{KeyValueStore, Storage};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{error, info, warn};

pub mod api;
pub mod clock;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod transport;
pub mod upload;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

use crate::{
    api::ChatApi,
    clock::{Clock, PresenceClock, SystemClock},
    config::ClientSettings,
    connection::ConnectionManager,
    conversation::ConversationStore,
    credentials::CredentialStore,
    error::{ClientError, Result},
    gateway::{RequestGateway, SessionSignal},
    presence::{PresenceTracker, PresenceWatch},
    transport::{Connector, WebSocketConnector},
    upload::{UploadProgress, Uploader},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Authenticated(Identity),
    LoggedOut,
    /// Authorization could not be recovered; the session was torn down and
    /// the user has to sign in again.
    Expired,
}

/// Owns one client session: credentials, the request gateway, the event
/// channel, presence and conversation state, wired together and torn down
/// as a unit.
pub struct SyncClient {
    settings: ClientSettings,
    credentials: Arc<CredentialStore>,
    gateway: Arc<RequestGateway>,
    api: ChatApi,
    uploader: Uploader,
    connection: Arc<ConnectionManager>,
    presence_clock: Arc<PresenceClock>,
    presence: Arc<PresenceTracker>,
    conversations: Arc<ConversationStore>,
    events: broadcast::Sender<SessionEvent>,
    expiry_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let credentials = Arc::new(CredentialStore::new(store));
        let gateway = RequestGateway::new(&settings.api_base_url, Arc::clone(&credentials));
        let api = ChatApi::new(Arc::clone(&gateway));
        let uploader = Uploader::new(Arc::clone(&gateway), settings.upload_chunk_bytes);
        let connection = ConnectionManager::new(
            connector,
            settings.reconnect_policy(),
            Some(Arc::clone(&credentials)),
        );
        let presence_clock = PresenceClock::new(Arc::clone(&clock));
        let presence = PresenceTracker::new(
            Arc::clone(&connection),
            Arc::clone(&presence_clock),
            settings.presence_settings(),
        );
        let conversations = ConversationStore::new(
            api.clone(),
            Arc::clone(&connection),
            clock,
            settings.history_page_size,
        );
        let (events, _) = broadcast::channel(16);

        Ok(Arc::new(Self {
            settings,
            credentials,
            gateway,
            api,
            uploader,
            connection,
            presence_clock,
            presence,
            conversations,
            events,
            expiry_listener: Mutex::new(None),
        }))
    }

    pub async fn open(settings: ClientSettings) -> Result<Arc<Self>> {
        let database_url =
            storage::prepare_database_url(&settings.database_url).map_err(ClientError::Storage)?;
        let store = Storage::new(&database_url)
            .await
            .map_err(ClientError::Storage)?;
        let connector = WebSocketConnector::new(&settings.socket_url)
            .map_err(|err| ClientError::Config(err.to_string()))?;
        Self::new(
            settings,
            Arc::new(store),
            Arc::new(connector),
            Arc::new(SystemClock),
        )
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn is_authenticated(&self) -> Result<bool> {
        self.credentials.is_authenticated().await
    }

    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<Identity> {
        let auth = self.api.login(email, password).await?;
        info!(user_id = %auth.identity.id, "session: logged in");
        self.start_session(auth).await
    }

    pub async fn register(self: &Arc<Self>, registration: &RegisterRequest) -> Result<Identity> {
        let auth = self.api.register(registration).await?;
        info!(user_id = %auth.identity.id, "session: registered");
        self.start_session(auth).await
    }

    pub async fn restore_session(self: &Arc<Self>) -> Result<Option<Identity>> {
        let (Some(pair), Some(identity)) = (
            self.credentials.credentials().await?,
            self.credentials.identity().await?,
        ) else {
            return Ok(None);
        };
        info!(user_id = %identity.id, "session: restoring persisted session");
        let identity = self
            .start_session(AuthResponse {
                identity,
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
            })
            .await?;
        Ok(Some(identity))
    }

    /// Ends the session: heartbeats stop, the channel closes, credentials
    /// and cached state are cleared, in that order.
    pub async fn logout(&self) -> Result<()> {
        self.teardown(SessionEvent::LoggedOut).await
    }

    pub fn watch_presence(&self, identity: UserId) -> PresenceWatch {
        self.presence.watch(identity)
    }

    pub async fn upload(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
        progress: Option<&(dyn Fn(UploadProgress) + Send + Sync)>,
    ) -> Result<Attachment> {
        self.uploader
            .upload(file_name, mime_type, bytes, progress)
            .await
    }

    async fn start_session(self: &Arc<Self>, auth: AuthResponse) -> Result<Identity> {
        let pair = CredentialPair {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
        };
        let identity = auth.identity;

        self.credentials.save_session(&pair, &identity).await?;
        self.gateway.reset_session();
        self.ensure_expiry_listener();

        self.conversations.set_session_identity(identity.clone());
        self.conversations.start();
        self.presence_clock.start(self.settings.presence_tick());
        self.presence.start();
        self.connection.connect(&pair.access_token);

        let _ = self.events.send(SessionEvent::Authenticated(identity.clone()));
        Ok(identity)
    }

    async fn teardown(&self, reason: SessionEvent) -> Result<()> {
        self.presence.stop_all();
        self.presence_clock.stop();
        self.connection.disconnect();
        let cleared = self.credentials.clear().await;
        self.conversations.stop();
        self.conversations.clear();

        match &reason {
            SessionEvent::Expired => warn!("session: expired, torn down"),
            _ => info!("session: logged out"),
        }
        let _ = self.events.send(reason);

        if let Err(err) = &cleared {
            error!("session: failed to clear persisted credentials: {err}");
        }
        cleared
    }

    fn ensure_expiry_listener(self: &Arc<Self>) {
        let mut listener = self.lock_expiry_listener();
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut signals = self.gateway.subscribe_session();
        let client: Weak<Self> = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(SessionSignal::Expired) => {
                        let Some(client) = client.upgrade() else {
                            break;
                        };
                        let _ = client.teardown(SessionEvent::Expired).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: missed session signals");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn lock_expiry_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.expiry_listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(listener) = self.lock_expiry_listener().take() {
            listener.abort();
        }
        self.presence.stop_all();
        self.connection.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
