//! Consul coordination backend
//!
//! Speaks the Consul HTTP API: `/v1/session` for sessions, `/v1/kv` with
//! `?acquire=`/`?release=` for the leader lock, `/v1/agent/service` for the
//! member registry. Sessions are created with the `delete` behavior so a
//! dead node's lock disappears together with its session.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::coordination::{
    Coordination, CoordinationError, RegisteredService, ServiceRegistration,
};

/// Per-request ceiling. Coordination calls run inside the heartbeat and
/// health loops and must never wedge them.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Consul-backed [`Coordination`] implementation.
pub struct ConsulCoordination {
    base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
}

impl ConsulCoordination {
    pub fn new(addr: &str) -> Result<Self, CoordinationError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            base: addr.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CoordinationError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CoordinationError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Acquire and release answer a bare `true`/`false` body.
    async fn bool_body(resp: reqwest::Response) -> Result<bool, CoordinationError> {
        let text = Self::check(resp).await?.text().await?;
        match text.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(CoordinationError::InvalidResponse(format!(
                "expected boolean, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Coordination for ConsulCoordination {
    async fn create_session(&self) -> Result<String, CoordinationError> {
        let resp = self
            .client
            .put(self.url("/v1/session/create"))
            .json(&json!({ "Behavior": "delete" }))
            .send()
            .await?;
        let created: SessionCreated = Self::check(resp).await?.json().await?;
        debug!("created session {}", created.id);
        Ok(created.id)
    }

    async fn renew_session(&self, session: &str) -> Result<(), CoordinationError> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/session/renew/{session}")))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn destroy_session(&self, session: &str) -> Result<(), CoordinationError> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/session/destroy/{session}")))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}?acquire={session}")))
            .body(session.to_string())
            .send()
            .await?;
        Self::bool_body(resp).await
    }

    async fn release(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/kv/{key}?release={session}")))
            .body(session.to_string())
            .send()
            .await?;
        Self::bool_body(resp).await
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/kv/{key}")))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn register_service(
        &self,
        service: &ServiceRegistration,
    ) -> Result<(), CoordinationError> {
        let resp = self
            .client
            .put(self.url("/v1/agent/service/register"))
            .json(&json!({
                "ID": service.id,
                "Name": service.name,
                "Tags": service.tags,
                "Address": service.address,
                "Port": service.port,
            }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn deregister_service(&self, id: &str) -> Result<(), CoordinationError> {
        let resp = self
            .client
            .put(self.url(&format!("/v1/agent/service/deregister/{id}")))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list_services(&self) -> Result<Vec<RegisteredService>, CoordinationError> {
        let resp = self.client.get(self.url("/v1/agent/services")).send().await?;
        let services: HashMap<String, AgentService> = Self::check(resp).await?.json().await?;
        Ok(services
            .into_values()
            .map(|s| RegisteredService {
                id: s.id,
                tags: s.tags,
                address: s.address,
                port: s.port,
            })
            .collect())
    }
}
