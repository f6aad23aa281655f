use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde::Deserialize;

use super::{AgentConnector, AgentError, NodeAgent};
use crate::k8s::PodInfo;
use cassandra_core::sidecar::{NodeState, OperationKind, OperationRecord, OperationRequest, StatusResponse};

/// The body of a `201 Created` response of `POST /operations`.
#[derive(Debug, Default, Deserialize)]
struct OperationCreated {
    #[serde(default)]
    id: Option<String>,
}

/// HTTP client of a single node agent.
#[derive(Clone)]
pub struct SidecarClient {
    /// The name of the pod this agent runs in.
    name: String,
    /// The base URL of the agent, absent when the pod has no address yet.
    base_url: Option<String>,
    client: Client,
}

impl SidecarClient {
    /// Create a new client using the given HTTP client.
    pub fn new(name: String, base_url: Option<String>, client: Client) -> Self {
        Self { name, base_url, client }
    }

    fn url(&self, path: &str) -> Result<String, AgentError> {
        match &self.base_url {
            Some(base) => Ok(format!("{}{}", base, path)),
            None => Err(AgentError::NoAddress(self.name.clone())),
        }
    }

    /// Ensure the response has a success status, capturing the body otherwise.
    async fn check(res: Response) -> Result<Response, AgentError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        Err(AgentError::Status { code: status.as_u16(), body })
    }
}

#[async_trait]
impl NodeAgent for SidecarClient {
    fn id(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "trace", skip(self), fields(agent = %self.name))]
    async fn status(&self) -> Result<NodeState, AgentError> {
        let res = self.client.get(self.url("/status")?).send().await?;
        let body = Self::check(res).await?.bytes().await?;
        let status: StatusResponse = serde_json::from_slice(&body)?;
        Ok(status.node_state)
    }

    #[tracing::instrument(level = "debug", skip(self, req), fields(agent = %self.name, kind = %req.kind))]
    async fn start_operation(&self, req: &OperationRequest) -> Result<String, AgentError> {
        let res = self.client.post(self.url("/operations")?).json(req).send().await?;
        let res = Self::check(res).await?;
        let location = res
            .headers()
            .get(header::LOCATION)
            .and_then(|val| val.to_str().ok())
            .map(String::from);
        let body = res.bytes().await?;

        // Prefer the ID of the body, falling back to the last segment of the Location header.
        let created: OperationCreated = serde_json::from_slice(&body).unwrap_or_default();
        if let Some(id) = created.id.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        location
            .as_deref()
            .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .ok_or(AgentError::MissingOperationId)
    }

    #[tracing::instrument(level = "trace", skip(self), fields(agent = %self.name))]
    async fn find_operation(&self, id: &str) -> Result<OperationRecord, AgentError> {
        let res = self.client.get(self.url(&format!("/operations/{}", id))?).send().await?;
        let body = Self::check(res).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(agent = %self.name))]
    async fn decommission(&self) -> Result<(), AgentError> {
        let req = OperationRequest::new(OperationKind::Decommission, Default::default());
        let res = self.client.post(self.url("/operations")?).json(&req).send().await?;
        Self::check(res).await?;
        Ok(())
    }
}

/// Connects to node agents over HTTP using the pod IP.
///
/// A single HTTP client is shared by all agents so that connections are pooled.
#[derive(Clone)]
pub struct HttpAgentConnector {
    client: Client,
    port: u16,
}

impl HttpAgentConnector {
    /// Create a new instance targeting agents on the given port.
    pub fn new(port: u16) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("cassandra-operator/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("error building node agent http client")?;
        Ok(Self { client, port })
    }

    /// Build the base URL of an agent.
    pub fn base_url(ip: &str, port: u16, secure: bool) -> String {
        let scheme = if secure { "https" } else { "http" };
        if ip.contains(':') {
            format!("{}://[{}]:{}", scheme, ip, port)
        } else {
            format!("{}://{}:{}", scheme, ip, port)
        }
    }
}

impl AgentConnector for HttpAgentConnector {
    fn connect(&self, pod: &PodInfo, secure: bool) -> Arc<dyn NodeAgent> {
        let base_url = pod.ip.as_deref().map(|ip| Self::base_url(ip, self.port, secure));
        Arc::new(SidecarClient::new(pod.name.clone(), base_url, self.client.clone()))
    }
}
