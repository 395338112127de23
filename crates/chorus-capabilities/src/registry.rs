//! Owner registry - the seam to the on-chain contract read.
//!
//! The registry answers a single point lookup:
//! `(contract_address, collaborator_address) → owner DID`. The deployed
//! implementation is a JSON-RPC gateway in front of the chain
//! ([`RpcOwnerRegistry`]); tests and single-process deployments use
//! [`StaticRegistry`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use chorus_core::Did;

use crate::error::{RegistryError, RegistryResult};

/// Default per-call deadline for registry reads.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC method exposed by the registry gateway.
const RPC_METHOD: &str = "registry_resolveOwner";

/// Resolves the owner DID recorded for a `(contract, collaborator)` pair.
#[async_trait]
pub trait OwnerRegistry: Send + Sync {
    /// Look up the owner DID. `Ok(None)` means the registry holds no
    /// entry for the pair; `Err` means the read itself failed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the registry cannot be reached or
    /// answers with something unparseable.
    async fn owner_of(
        &self,
        contract_address: &str,
        collaborator_address: &str,
    ) -> RegistryResult<Option<Did>>;
}

/// JSON-RPC client for the on-chain registry gateway.
pub struct RpcOwnerRegistry {
    endpoint: String,
    http: reqwest::Client,
}

impl RpcOwnerRegistry {
    /// Build a registry client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unreachable`] if the HTTP client cannot
    /// be constructed.
    pub fn new(endpoint: impl Into<String>) -> RegistryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }
}

impl std::fmt::Debug for RpcOwnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcOwnerRegistry")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OwnerRegistry for RpcOwnerRegistry {
    async fn owner_of(
        &self,
        contract_address: &str,
        collaborator_address: &str,
    ) -> RegistryResult<Option<Did>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": RPC_METHOD,
            "params": [contract_address, collaborator_address],
        });
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RegistryError::BadResponse(e.to_string()))?;

        if let Some(err) = reply.get("error") {
            warn!(%err, contract = contract_address, "registry call failed");
            return Err(RegistryError::BadResponse(err.to_string()));
        }
        match reply.get("result") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(did)) => Ok(Some(Did::new(did.clone()))),
            Some(other) => Err(RegistryError::BadResponse(format!(
                "unexpected result type: {other}"
            ))),
        }
    }
}

/// Map-backed registry for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: HashMap<(String, String), Did>,
}

impl StaticRegistry {
    /// An empty registry: every lookup resolves to no owner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` for the `(contract, collaborator)` pair.
    /// Addresses are normalized to lowercase.
    #[must_use]
    pub fn with_owner(
        mut self,
        contract_address: &str,
        collaborator_address: &str,
        owner: Did,
    ) -> Self {
        self.entries.insert(
            (
                contract_address.to_lowercase(),
                collaborator_address.to_lowercase(),
            ),
            owner,
        );
        self
    }
}

#[async_trait]
impl OwnerRegistry for StaticRegistry {
    async fn owner_of(
        &self,
        contract_address: &str,
        collaborator_address: &str,
    ) -> RegistryResult<Option<Did>> {
        Ok(self
            .entries
            .get(&(
                contract_address.to_lowercase(),
                collaborator_address.to_lowercase(),
            ))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_registry_lookup() {
        let registry =
            StaticRegistry::new().with_owner("0xAA", "0xBB", Did::new("did:key:O"));

        let hit = registry.owner_of("0xaa", "0xbb").await.unwrap();
        assert_eq!(hit, Some(Did::new("did:key:O")));

        let miss = registry.owner_of("0xaa", "0xcc").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_static_registry_case_insensitive() {
        let registry =
            StaticRegistry::new().with_owner("0xAbCd", "0xEf01", Did::new("did:key:O"));
        let hit = registry.owner_of("0xABCD", "0xEF01").await.unwrap();
        assert!(hit.is_some());
    }
}
