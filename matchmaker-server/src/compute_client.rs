//! HTTP/JSON `ComputeNodeClient`: the Dispatcher's view of a compute node's
//! `CreateRoom` endpoint. One pooled `reqwest::Client` is shared across every
//! compute node address — `reqwest` keeps its own per-host connection pool,
//! so this never opens a fresh TCP connection per drain the way a naive
//! one-shot client would.

use async_trait::async_trait;
use matchmaker_core::{ComputeNodeClient, MatchmakerError, Result};
use protocol::{ComputeTopic, CreateRoomRequest, CreateRoomResponse};

pub struct HttpComputeNodeClient {
    client: reqwest::Client,
}

impl HttpComputeNodeClient {
    pub fn new() -> Self {
        HttpComputeNodeClient {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpComputeNodeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeNodeClient for HttpComputeNodeClient {
    async fn create_room(
        &self,
        address: &ComputeTopic,
        request: CreateRoomRequest,
    ) -> Result<CreateRoomResponse> {
        let url = format!("http://{address}/create_room");
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| MatchmakerError::RpcUnavailable(address.clone(), e.to_string()))?;

        response
            .json::<CreateRoomResponse>()
            .await
            .map_err(|e| MatchmakerError::RpcUnavailable(address.clone(), e.to_string()))
    }
}
