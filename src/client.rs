//! HTTP client used to forward requests to process workers.
//!
//! Workers listen on plain HTTP on localhost. Idle connections are never
//! pooled: after a swap the same port belongs to a different process, and a
//! kept-alive socket would still point at the old one.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HyperClient = Client<HttpConnector, axum::body::Body>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client() -> HyperClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(5)));

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(0)
        .build(http)
}
