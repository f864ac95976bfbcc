//! HTTP client for the backend's pull endpoints.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use nerve_core::{DomainId, FetchError};

use crate::domains::{PriceCurve, RegionSummary};
use crate::poller::FetchFuture;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A pull endpoint and the domain its snapshots are stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `GET /api/dashboard/stats`
    DashboardStats,
    /// `GET /api/regions/summary`
    RegionsSummary,
    /// `GET /api/prices/curve?region_id=<region_id>`
    PriceCurve { region_id: String },
}

impl Endpoint {
    pub fn domain(&self) -> DomainId {
        match self {
            Self::DashboardStats => DomainId::from("stats"),
            Self::RegionsSummary => DomainId::from("regions"),
            Self::PriceCurve { region_id } => DomainId::new(format!("price_curve:{region_id}")),
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::DashboardStats => "/api/dashboard/stats",
            Self::RegionsSummary => "/api/regions/summary",
            Self::PriceCurve { .. } => "/api/prices/curve",
        }
    }

    fn query(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::PriceCurve { region_id } => vec![("region_id", region_id.as_str())],
            _ => Vec::new(),
        }
    }

    /// Check that `body` has the shape this endpoint promises.
    fn validate(&self, body: &Value) -> Result<(), FetchError> {
        match self {
            Self::DashboardStats if body.is_object() => Ok(()),
            Self::DashboardStats => Err(FetchError::Decode(
                "dashboard stats: expected a JSON object".into(),
            )),
            Self::RegionsSummary => check_shape::<Vec<RegionSummary>>("regions summary", body),
            Self::PriceCurve { .. } => check_shape::<PriceCurve>("price curve", body),
        }
    }
}

fn check_shape<T: DeserializeOwned>(what: &str, body: &Value) -> Result<(), FetchError> {
    T::deserialize(body)
        .map(|_| ())
        .map_err(|e| FetchError::Decode(format!("{what}: {e}")))
}

/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One GET of `endpoint`, returning the validated raw JSON body.
    pub async fn fetch(&self, endpoint: &Endpoint) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let mut request = self.http.get(&url);
        let query = endpoint.query();
        if !query.is_empty() {
            request = request.query(&query);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        endpoint.validate(&body)?;
        tracing::debug!(url = %url, "backend: fetched");
        Ok(body)
    }

    /// A fetch function for [`SnapshotPoller::register`](crate::SnapshotPoller::register).
    pub fn fetcher(&self, endpoint: Endpoint) -> impl Fn() -> FetchFuture + Send + Sync + 'static {
        let client = self.clone();
        move || -> FetchFuture {
            let client = client.clone();
            let endpoint = endpoint.clone();
            Box::pin(async move { client.fetch(&endpoint).await })
        }
    }
}
