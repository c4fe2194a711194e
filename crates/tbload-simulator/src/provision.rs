//! Provisioning collaborator.
//!
//! The engine only needs create-or-find, relations and removal. The REST
//! implementation talks to a ThingsBoard-style tenant API; the in-memory one
//! backs dry runs and tests.

use crate::config::RestConfig;
use crate::error::ProvisionError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tbload_core::{ClientRole, DeviceId};
use tracing::{debug, info};

/// Relation type linking gateways and their devices
pub const CREATED_RELATION: &str = "Created";

/// An entity to create or find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: DeviceId,
    pub role: ClientRole,
    /// Device profile / type
    pub profile: String,
}

/// A provisioned entity and the credential to connect with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandle {
    pub name: DeviceId,
    pub entity_id: String,
    pub token: String,
    /// False when the entity already existed
    pub created: bool,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the entity, or return the existing one with the same name.
    async fn provision(&self, spec: &EntitySpec) -> Result<ClientHandle, ProvisionError>;

    async fn relate(
        &self,
        from: &ClientHandle,
        to: &ClientHandle,
        relation: &str,
    ) -> Result<(), ProvisionError>;

    async fn remove(&self, handle: &ClientHandle) -> Result<(), ProvisionError>;
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct EntityId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DeviceBody {
    id: EntityId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceCredentials {
    credentials_id: String,
}

/// Provisioner backed by the platform's tenant REST API.
pub struct RestProvisioner {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    jwt: Mutex<Option<String>>,
}

impl RestProvisioner {
    pub fn new(config: &RestConfig) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            jwt: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String, ProvisionError> {
        let response = self
            .client
            .post(self.url("/api/auth/login"))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Auth(format!("{} - {}", status, body)));
        }

        let login: LoginResponse = response.json().await?;
        info!("Logged in to {} as {}", self.base_url, self.username);
        *self.jwt.lock() = Some(login.token.clone());
        Ok(login.token)
    }

    async fn token(&self) -> Result<String, ProvisionError> {
        let cached = self.jwt.lock().clone();
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    /// Send an authorized request, logging in again once on 401.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, ProvisionError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut token = self.token().await?;
        for attempt in 0..2 {
            let response = build(&self.client)
                .header("X-Authorization", format!("Bearer {}", token))
                .send()
                .await?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("Session expired, logging in again");
                token = self.login().await?;
                continue;
            }
            return Ok(response);
        }
        Err(ProvisionError::Auth("rejected after re-login".to_string()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProvisionError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ProvisionError::Server { status, body })
        }
    }

    async fn find(&self, name: &str) -> Result<Option<DeviceBody>, ProvisionError> {
        let url = self.url("/api/tenant/devices");
        let response = self
            .send(|c| c.get(&url).query(&[("deviceName", name)]))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let device = Self::check(response).await?.json().await?;
        Ok(Some(device))
    }

    async fn credentials(&self, device_id: &str) -> Result<String, ProvisionError> {
        let url = self.url(&format!("/api/device/{}/credentials", device_id));
        let response = Self::check(self.send(|c| c.get(&url)).await?).await?;
        let credentials: DeviceCredentials = response.json().await?;
        Ok(credentials.credentials_id)
    }
}

#[async_trait]
impl Provisioner for RestProvisioner {
    async fn provision(&self, spec: &EntitySpec) -> Result<ClientHandle, ProvisionError> {
        if let Some(existing) = self.find(spec.name.as_str()).await? {
            let token = self.credentials(&existing.id.id).await?;
            return Ok(ClientHandle {
                name: spec.name.clone(),
                entity_id: existing.id.id,
                token,
                created: false,
            });
        }

        let mut body = json!({ "name": spec.name.as_str(), "type": spec.profile });
        if spec.role == ClientRole::Gateway {
            body["additionalInfo"] = json!({ "gateway": true });
        }

        // the device name doubles as its access token
        let url = self.url("/api/device");
        let token = spec.name.as_str();
        let response = self
            .send(|c| c.post(&url).query(&[("accessToken", token)]).json(&body))
            .await?;
        let device: DeviceBody = Self::check(response).await?.json().await?;
        debug!("Created {} {} ({})", spec.role, spec.name, device.id.id);

        Ok(ClientHandle {
            name: spec.name.clone(),
            entity_id: device.id.id,
            token: token.to_string(),
            created: true,
        })
    }

    async fn relate(
        &self,
        from: &ClientHandle,
        to: &ClientHandle,
        relation: &str,
    ) -> Result<(), ProvisionError> {
        let body = json!({
            "from": { "id": from.entity_id, "entityType": "DEVICE" },
            "to": { "id": to.entity_id, "entityType": "DEVICE" },
            "type": relation,
            "typeGroup": "COMMON",
        });
        let url = self.url("/api/relation");
        Self::check(self.send(|c| c.post(&url).json(&body)).await?).await?;
        Ok(())
    }

    async fn remove(&self, handle: &ClientHandle) -> Result<(), ProvisionError> {
        let url = self.url(&format!("/api/device/{}", handle.entity_id));
        let response = self.send(|c| c.delete(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProvisionError::NotFound(handle.name.to_string()));
        }
        Self::check(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Idempotent in-memory provisioner.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    entities: DashMap<String, ClientHandle>,
    relations: Mutex<BTreeSet<(String, String, String)>>,
    rejected: Mutex<HashSet<String>>,
    outages: AtomicU32,
    creates: AtomicU64,
    removals: AtomicU64,
    latency: Mutex<Duration>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisioning `name` always fails.
    pub fn reject(&self, name: &str) {
        self.rejected.lock().insert(name.to_string());
    }

    /// The next `n` provision calls fail with a server error.
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Total entities ever created
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Distinct `(from, to, type)` triples by entity name, sorted
    pub fn relations(&self) -> Vec<(String, String, String)> {
        self.relations.lock().iter().cloned().collect()
    }

    fn take_outage(&self) -> bool {
        self.outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn provision(&self, spec: &EntitySpec) -> Result<ClientHandle, ProvisionError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.take_outage() {
            return Err(ProvisionError::Server {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        if self.rejected.lock().contains(spec.name.as_str()) {
            return Err(ProvisionError::Rejected(spec.name.to_string()));
        }

        let mut created = false;
        let handle = self
            .entities
            .entry(spec.name.to_string())
            .or_insert_with(|| {
                created = true;
                let n = self.creates.fetch_add(1, Ordering::Relaxed);
                ClientHandle {
                    name: spec.name.clone(),
                    entity_id: format!("{}-{:08x}", spec.role, n),
                    token: spec.name.to_string(),
                    created: true,
                }
            })
            .clone();

        Ok(ClientHandle { created, ..handle })
    }

    async fn relate(
        &self,
        from: &ClientHandle,
        to: &ClientHandle,
        relation: &str,
    ) -> Result<(), ProvisionError> {
        for end in [from, to] {
            if !self.entities.contains_key(end.name.as_str()) {
                return Err(ProvisionError::NotFound(end.name.to_string()));
            }
        }
        // saving an existing relation again leaves a single copy
        self.relations.lock().insert((
            from.name.to_string(),
            to.name.to_string(),
            relation.to_string(),
        ));
        Ok(())
    }

    async fn remove(&self, handle: &ClientHandle) -> Result<(), ProvisionError> {
        match self.entities.remove(handle.name.as_str()) {
            Some(_) => {
                self.removals.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(ProvisionError::NotFound(handle.name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(index: u64) -> EntitySpec {
        EntitySpec {
            name: DeviceId::indexed("DW", index),
            role: ClientRole::Device,
            profile: "ffu".to_string(),
        }
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let provisioner = MemoryProvisioner::new();

        let first = provisioner.provision(&spec(1)).await.unwrap();
        assert!(first.created);
        assert_eq!(first.token, "DW00000001");

        let second = provisioner.provision(&spec(1)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.entity_id, first.entity_id);

        assert_eq!(provisioner.len(), 1);
        assert_eq!(provisioner.creates(), 1);
    }

    #[tokio::test]
    async fn test_outages_and_rejections() {
        let provisioner = MemoryProvisioner::new();
        provisioner.fail_next(2);
        provisioner.reject("DW00000009");

        assert!(matches!(
            provisioner.provision(&spec(1)).await,
            Err(ProvisionError::Server { status: 503, .. })
        ));
        assert!(provisioner.provision(&spec(1)).await.is_err());
        assert!(provisioner.provision(&spec(1)).await.is_ok());
        assert!(matches!(
            provisioner.provision(&spec(9)).await,
            Err(ProvisionError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_relations_and_removal() {
        let provisioner = MemoryProvisioner::new();
        let gateway = provisioner
            .provision(&EntitySpec {
                name: DeviceId::indexed("GW", 0),
                role: ClientRole::Gateway,
                profile: "gateway".to_string(),
            })
            .await
            .unwrap();
        let device = provisioner.provision(&spec(1)).await.unwrap();

        provisioner.relate(&gateway, &device, CREATED_RELATION).await.unwrap();
        provisioner.relate(&device, &gateway, CREATED_RELATION).await.unwrap();
        assert_eq!(
            provisioner.relations(),
            vec![
                (
                    "DW00000001".to_string(),
                    "GW00000000".to_string(),
                    "Created".to_string()
                ),
                (
                    "GW00000000".to_string(),
                    "DW00000001".to_string(),
                    "Created".to_string()
                ),
            ]
        );

        // relating the same pair again keeps one copy
        provisioner.relate(&gateway, &device, CREATED_RELATION).await.unwrap();
        assert_eq!(provisioner.relations().len(), 2);

        provisioner.remove(&device).await.unwrap();
        assert!(!provisioner.contains("DW00000001"));
        assert!(matches!(
            provisioner.remove(&device).await,
            Err(ProvisionError::NotFound(_))
        ));
        assert!(provisioner.relate(&gateway, &device, CREATED_RELATION).await.is_err());
    }
}
