//! RPC surface of the remote spreadsheet document.
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::RpcError;
use crate::types::{CellUpdate, ColumnHeader, RemoteChange, SyncMode};

/// Functions exposed by the remote document.
#[async_trait]
pub trait RemoteRpc: Send + Sync {
    async fn set_sync_mode(&self, mode: SyncMode) -> Result<()>;

    /// Register the URL the remote side should deliver realtime changes to.
    async fn set_tunnel_url(&self, url: &str) -> Result<()>;

    /// All remote edits not yet acknowledged.
    async fn get_unsynced(&self) -> Result<Vec<RemoteChange>>;

    async fn mark_synced(&self, ids: &[String]) -> Result<()>;

    async fn get_column_headers(&self, sheet: &str) -> Result<Vec<ColumnHeader>>;

    async fn batch_update_cells(&self, updates: &[CellUpdate]) -> Result<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcRequest<'a> {
    function: &'a str,
    parameters: Vec<Value>,
    target_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<Value>,
}

/// JSON-over-HTTP client for the remote document.
#[derive(Clone)]
pub struct HttpRpcClient {
    client: Client,
    endpoint: String,
    target_id: String,
}

impl HttpRpcClient {
    pub fn new(endpoint: impl Into<String>, target_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            target_id: target_id.into(),
        })
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        Self::new(
            config.endpoint.clone(),
            config.document_id.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn call<T: DeserializeOwned>(&self, function: &str, parameters: Vec<Value>) -> Result<T, RpcError> {
        debug!("RPC {} -> {}", function, self.endpoint);
        let request = RpcRequest {
            function,
            parameters,
            target_id: &self.target_id,
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RpcError::Status {
                function: function.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        decode_response(function, &body)
    }
}

/// Decode a 2xx response body, surfacing remote-reported errors.
fn decode_response<T: DeserializeOwned>(function: &str, body: &str) -> Result<T, RpcError> {
    let decode_err = |source| RpcError::Decode {
        function: function.to_string(),
        source,
    };

    let envelope: RpcResponse = if body.trim().is_empty() {
        RpcResponse {
            result: Value::Null,
            error: None,
        }
    } else {
        serde_json::from_str(body).map_err(decode_err)?
    };

    if let Some(error) = envelope.error.filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RpcError::Remote {
            function: function.to_string(),
            message,
        });
    }

    serde_json::from_value(envelope.result).map_err(decode_err)
}

#[async_trait]
impl RemoteRpc for HttpRpcClient {
    async fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        let _: Value = self.call("setSyncMode", vec![json!(mode.as_str())]).await?;
        Ok(())
    }

    async fn set_tunnel_url(&self, url: &str) -> Result<()> {
        let _: Value = self.call("setTunnelUrl", vec![json!(url)]).await?;
        Ok(())
    }

    async fn get_unsynced(&self) -> Result<Vec<RemoteChange>> {
        let changes: Option<Vec<RemoteChange>> = self.call("getUnsynced", Vec::new()).await?;
        Ok(changes.unwrap_or_default())
    }

    async fn mark_synced(&self, ids: &[String]) -> Result<()> {
        let _: Value = self.call("markSynced", vec![json!(ids)]).await?;
        Ok(())
    }

    async fn get_column_headers(&self, sheet: &str) -> Result<Vec<ColumnHeader>> {
        let headers: Option<Vec<ColumnHeader>> =
            self.call("getColumnHeaders", vec![json!(sheet)]).await?;
        Ok(headers.unwrap_or_default())
    }

    async fn batch_update_cells(&self, updates: &[CellUpdate]) -> Result<()> {
        let updates = serde_json::to_value(updates)?;
        let _: Value = self.call("batchUpdateCells", vec![updates]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_target_id_field() {
        let request = RpcRequest {
            function: "getUnsynced",
            parameters: Vec::new(),
            target_id: "doc-1",
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["targetId"], "doc-1");
        assert_eq!(value["function"], "getUnsynced");
        assert!(value["parameters"].as_array().unwrap().is_empty());
    }

    #[test]
    fn decodes_result_payload() {
        let headers: Vec<ColumnHeader> = decode_response(
            "getColumnHeaders",
            r#"{"result": [{"index": 1, "header": "Name"}, {"index": 2, "header": "Amount"}]}"#,
        )
        .unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].header, "Amount");
    }

    #[test]
    fn empty_body_decodes_as_null_result() {
        let changes: Option<Vec<RemoteChange>> = decode_response("getUnsynced", "").unwrap();
        assert!(changes.is_none());
    }

    #[test]
    fn remote_error_is_surfaced() {
        let err = decode_response::<Value>(
            "markSynced",
            r#"{"error": {"message": "sheet is protected"}}"#,
        )
        .unwrap_err();
        match err {
            RpcError::Remote { function, message } => {
                assert_eq!(function, "markSynced");
                assert_eq!(message, "sheet is protected");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let err = decode_response::<Vec<ColumnHeader>>("getColumnHeaders", r#"{"result": 7}"#)
            .unwrap_err();
        assert!(matches!(err, RpcError::Decode { .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let client = HttpRpcClient::new("http://127.0.0.1:9/rpc", "doc-1", Duration::from_millis(200))
            .expect("client");
        let err = client.get_unsynced().await.unwrap_err();
        assert!(err.downcast_ref::<RpcError>().is_some());
    }
}
