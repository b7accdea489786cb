//! Known users and credential verification.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::Authorizer;
use crate::store::{Section, Store, StoreError};

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Identity asserted by a credential provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable provider-side id.
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

/// What clients get to see about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicProfile {
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(flatten)]
    pub profile: Profile,
    /// Server-issued credential carried in the `identity` cookie.
    pub uuid: String,
}

impl UserRecord {
    pub fn public(&self) -> PublicProfile {
        PublicProfile {
            email: self.profile.email.clone(),
            name: self.profile.name.clone(),
            domain: self.profile.domain.clone(),
            photo: self.profile.photo.clone(),
        }
    }
}

pub trait CredentialVerifier: Send + Sync + 'static {
    /// Resolve a provider token to a profile, or `None` if it does not verify.
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<Profile>>;
}

/// Verifies Google ID tokens through the tokeninfo endpoint.
pub struct GoogleVerifier {
    client_id: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenInfo {
    aud: String,
    sub: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hd: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl GoogleVerifier {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn lookup(&self, token: &str) -> Result<TokenInfo, reqwest::Error> {
        self.http
            .get(TOKENINFO_URL)
            .query(&[("id_token", token)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

impl CredentialVerifier for GoogleVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<Profile>> {
        async move {
            if self.client_id.is_empty() {
                debug!("no client id configured, rejecting credential");
                return None;
            }
            let info = match self.lookup(token).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(%err, "token verification failed");
                    return None;
                }
            };
            if info.aud != self.client_id {
                warn!(aud = %info.aud, "token issued for another audience");
                return None;
            }
            Some(Profile {
                id: info.sub,
                name: info.name.unwrap_or_else(|| info.email.clone()),
                email: info.email,
                domain: info.hd,
                photo: info.picture,
            })
        }
        .boxed()
    }
}

#[derive(Default)]
struct Directory {
    by_id: HashMap<String, UserRecord>,
    uuid_to_id: HashMap<String, String>,
}

impl Directory {
    fn insert(&mut self, record: UserRecord) {
        self.uuid_to_id
            .insert(record.uuid.clone(), record.profile.id.clone());
        self.by_id.insert(record.profile.id.clone(), record);
    }
}

#[derive(Clone)]
pub struct Users {
    section: Section,
    directory: Arc<Mutex<Directory>>,
}

impl Users {
    /// Read every stored record. Serve requests only after this returns.
    pub async fn load(store: &Store) -> Result<Self, StoreError> {
        let section = store.section("users");
        let mut directory = Directory::default();
        for (_, record) in section.entries::<UserRecord>().await? {
            directory.insert(record);
        }
        info!(users = directory.by_id.len(), "loaded users");
        Ok(Self {
            section,
            directory: Arc::new(Mutex::new(directory)),
        })
    }

    pub fn by_uuid(&self, uuid: &str) -> Option<UserRecord> {
        let directory = self.directory.lock();
        let id = directory.uuid_to_id.get(uuid)?;
        directory.by_id.get(id).cloned()
    }

    pub fn by_id(&self, id: &str) -> Option<UserRecord> {
        self.directory.lock().by_id.get(id).cloned()
    }

    /// Verify `token` and upsert the user it names.
    pub async fn from_token(
        &self,
        verifier: &dyn CredentialVerifier,
        token: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let Some(profile) = verifier.verify(token).await else {
            return Ok(None);
        };
        let record = {
            let mut directory = self.directory.lock();
            let record = match directory.by_id.get(&profile.id) {
                Some(existing) => UserRecord {
                    profile,
                    uuid: existing.uuid.clone(),
                },
                None => {
                    info!(user = %profile.id, "new user");
                    UserRecord {
                        profile,
                        uuid: uuid::Uuid::new_v4().to_string(),
                    }
                }
            };
            directory.insert(record.clone());
            record
        };
        self.section.set(&record.profile.id, &record).await?;
        Ok(Some(record))
    }
}

impl Authorizer for Users {
    fn authorized(&self, token: &str) -> bool {
        self.directory.lock().uuid_to_id.contains_key(token)
    }
}
