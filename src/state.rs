//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthLiveness, Authorizer};
use crate::config::Settings;
use crate::docs::{DocumentSync, MemoryDocs};
use crate::queue::AdmissionQueue;
use crate::room::RoomContext;
use crate::rooms::Rooms;
use crate::store::Store;
use crate::users::{CredentialVerifier, GoogleVerifier, Users};

#[derive(Clone)]
pub struct AppState {
    pub rooms: Rooms,
    pub users: Users,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// OAuth client id handed to browsers so they can request credentials.
    pub client_id: String,
    pub auth_timeout: Duration,
}

impl AppState {
    /// Open storage and load users. Requests should only be served afterwards.
    pub async fn build(settings: &Settings) -> anyhow::Result<Self> {
        let store = Store::open(&settings.db_root);
        let users = Users::load(&store).await?;
        let queue = AdmissionQueue::new(settings.parallel_runs)?;
        let rooms = Rooms::new(RoomContext {
            store,
            queue: Arc::new(queue),
            docs: Arc::new(MemoryDocs::new()),
            sandbox: Arc::new(settings.sandbox.clone()),
            default_visibility: settings.default_visibility,
        });
        Ok(Self {
            rooms,
            users,
            verifier: Arc::new(GoogleVerifier::new(settings.gapi_client_id.clone())),
            client_id: settings.gapi_client_id.clone(),
            auth_timeout: settings.auth_timeout,
        })
    }

    pub fn docs(&self) -> &Arc<dyn DocumentSync> {
        &self.rooms.context().docs
    }

    /// Fresh per-connection authorization tracker backed by the user directory.
    pub fn auth_liveness(&self) -> AuthLiveness {
        let users: Arc<dyn Authorizer> = Arc::new(self.users.clone());
        AuthLiveness::new(users, self.auth_timeout)
    }
}
