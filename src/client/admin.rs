//! HTTP client for the metadata manager's admin API.

use crate::cluster::ClusterSnapshot;
use crate::error::{FlexError, Result, WireError};
use crate::events::Event;
use crate::metadata::{
    CancelResponse, CreateDomainRequest, CreatePool, CreateVolume, ExtendVolumeRequest,
    FailResponse, MapVolumeRequest, RebuildRateRequest,
};
use crate::types::*;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Default connection timeout for admin requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout for admin operations.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the admin API.
#[derive(Clone)]
pub struct AdminClient {
    base_url: String,
    client: Client,
}

impl AdminClient {
    /// Create a client with default timeouts.
    pub fn new(addr: &str) -> Self {
        Self::with_timeouts(addr, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(addr: &str, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, turning error statuses back into typed errors.
    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| FlexError::Network(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<WireError>().await {
            Ok(wire) => Err(FlexError::from_wire(wire)),
            Err(_) => Err(FlexError::Protocol(format!("admin API returned {}", status))),
        }
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| FlexError::Serialization(e.to_string()))
    }

    /// Check server health.
    pub async fn health(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| FlexError::Network(e.to_string()))?;
        Ok(response.status().is_success())
    }

    pub async fn snapshot(&self, fresh: bool) -> Result<ClusterSnapshot> {
        let request = self
            .client
            .get(self.url("/snapshot"))
            .query(&[("fresh", fresh)]);
        self.json(request).await
    }

    pub async fn events(&self, limit: usize, pool_id: Option<PoolId>) -> Result<Vec<Event>> {
        let mut request = self
            .client
            .get(self.url("/events"))
            .query(&[("limit", limit)]);
        if let Some(pool_id) = pool_id {
            request = request.query(&[("pool", pool_id)]);
        }
        self.json(request).await
    }

    pub async fn create_protection_domain(&self, name: &str) -> Result<ProtectionDomain> {
        let request = self
            .client
            .post(self.url("/domains"))
            .json(&CreateDomainRequest {
                name: name.to_string(),
            });
        self.json(request).await
    }

    pub async fn list_protection_domains(&self) -> Result<Vec<ProtectionDomain>> {
        self.json(self.client.get(self.url("/domains"))).await
    }

    pub async fn delete_protection_domain(&self, id: ProtectionDomainId) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/domains/{}", id))))
            .await
            .map(|_| ())
    }

    pub async fn create_pool(&self, request: &CreatePool) -> Result<Pool> {
        self.json(self.client.post(self.url("/pools")).json(request))
            .await
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.json(self.client.get(self.url("/pools"))).await
    }

    pub async fn get_pool(&self, id: PoolId) -> Result<Pool> {
        self.json(self.client.get(self.url(&format!("/pools/{}", id))))
            .await
    }

    pub async fn delete_pool(&self, id: PoolId) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/pools/{}", id))))
            .await
            .map(|_| ())
    }

    pub async fn rebuild_status(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        self.json(
            self.client
                .get(self.url(&format!("/pools/{}/rebuild", pool_id))),
        )
        .await
    }

    pub async fn start_rebuild(&self, pool_id: PoolId) -> Result<Option<RebuildJob>> {
        self.json(
            self.client
                .post(self.url(&format!("/pools/{}/rebuild", pool_id))),
        )
        .await
    }

    /// Returns false if no rebuild was running.
    pub async fn cancel_rebuild(&self, pool_id: PoolId) -> Result<bool> {
        let response: CancelResponse = self
            .json(
                self.client
                    .post(self.url(&format!("/pools/{}/rebuild/cancel", pool_id))),
            )
            .await?;
        Ok(response.cancelled)
    }

    pub async fn set_rebuild_rate(&self, pool_id: PoolId, rate_mbps: u64) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!("/pools/{}/rebuild-rate", pool_id)))
            .json(&RebuildRateRequest { rate_mbps });
        self.send(request).await.map(|_| ())
    }

    pub async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        self.json(self.client.get(self.url("/nodes"))).await
    }

    pub async fn remove_storage_node(&self, node_id: NodeId) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/nodes/{}", node_id))))
            .await
            .map(|_| ())
    }

    /// Returns false if the node was already DOWN.
    pub async fn fail_node(&self, node_id: NodeId) -> Result<bool> {
        let response: FailResponse = self
            .json(
                self.client
                    .post(self.url(&format!("/nodes/{}/fail", node_id))),
            )
            .await?;
        Ok(response.failed)
    }

    pub async fn recover_node(&self, node_id: NodeId) -> Result<RecoveryReport> {
        self.json(
            self.client
                .post(self.url(&format!("/nodes/{}/recover", node_id))),
        )
        .await
    }

    pub async fn list_clients(&self) -> Result<Vec<ClientNode>> {
        self.json(self.client.get(self.url("/clients"))).await
    }

    pub async fn create_volume(&self, request: &CreateVolume) -> Result<Volume> {
        self.json(self.client.post(self.url("/volumes")).json(request))
            .await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.json(self.client.get(self.url("/volumes"))).await
    }

    pub async fn get_volume(&self, id: VolumeId) -> Result<Volume> {
        self.json(self.client.get(self.url(&format!("/volumes/{}", id))))
            .await
    }

    pub async fn extend_volume(&self, id: VolumeId, size: u64) -> Result<Volume> {
        let request = self
            .client
            .post(self.url(&format!("/volumes/{}/extend", id)))
            .json(&ExtendVolumeRequest { size });
        self.json(request).await
    }

    pub async fn delete_volume(&self, id: VolumeId) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/volumes/{}", id))))
            .await
            .map(|_| ())
    }

    pub async fn map_volume(
        &self,
        volume_id: VolumeId,
        client_id: ClientId,
        access_mode: AccessMode,
    ) -> Result<VolumeMapping> {
        let request = self
            .client
            .post(self.url(&format!("/volumes/{}/map", volume_id)))
            .json(&MapVolumeRequest {
                client_id,
                access_mode,
            });
        self.json(request).await
    }

    pub async fn unmap_volume(&self, volume_id: VolumeId, client_id: ClientId) -> Result<()> {
        let url = self.url(&format!("/volumes/{}/map/{}", volume_id, client_id));
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    pub async fn list_mappings(&self) -> Result<Vec<VolumeMapping>> {
        self.json(self.client.get(self.url("/mappings"))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(AdminClient::new("127.0.0.1:6612").base_url(), "http://127.0.0.1:6612");
        assert_eq!(
            AdminClient::new("http://mdm.local:6612/").base_url(),
            "http://mdm.local:6612"
        );
    }
}
