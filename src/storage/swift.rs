// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! OpenStack Swift backend (v1 auth).
//!
//! ```text
//! GET  {address}                          X-Auth-User / X-Auth-Key
//!   -> X-Storage-Url, X-Auth-Token
//! PUT  {storage_url}/{prefix}{type}       create container (idempotent)
//! PUT  {storage_url}/{prefix}{type}/{locator}
//! GET  {storage_url}/{prefix}{type}/{locator}
//! HEAD {storage_url}/{prefix}{type}/{locator}
//! ```
//!
//! An expired token (401) triggers one re-authentication. Rejected
//! credentials are [`StorageError::Fatal`]; other failures are transient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::RwLock;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::traits::{StorageError, UnitBackend};
use crate::index::ItemType;
use crate::resilience::retry::{retry, RetryConfig};

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Deserialize)]
pub struct SwiftStorageConfig {
    /// v1 auth endpoint, e.g. `https://swift.example.com/auth/v1.0`
    pub address: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub container_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for SwiftStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwiftStorageConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("container_prefix", &self.container_prefix)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug)]
struct Session {
    storage_url: String,
    token: String,
}

pub struct SwiftBackend {
    client: reqwest::Client,
    config: SwiftStorageConfig,
    session: RwLock<Option<Arc<Session>>>,
    containers: DashSet<ItemType>,
}

fn status_error(status: StatusCode, context: &str) -> StorageError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::Fatal(format!("{}: swift returned {}", context, status))
        }
        StatusCode::NOT_FOUND => StorageError::NotFound(context.to_string()),
        _ => StorageError::Backend(format!("{}: swift returned {}", context, status)),
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> StorageError {
    StorageError::Backend(format!("{}: {}", context, err))
}

impl SwiftBackend {
    /// Validate the config, build the HTTP client and authenticate once.
    pub async fn init(config: SwiftStorageConfig) -> Result<Self, StorageError> {
        for (field, value) in [
            ("address", &config.address),
            ("username", &config.username),
            ("password", &config.password),
        ] {
            if value.is_empty() {
                return Err(StorageError::Config(format!("swift {} is required", field)));
            }
        }
        if config.timeout_secs == 0 {
            return Err(StorageError::Config("swift timeout_secs must be positive".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StorageError::Config(format!("building swift client: {}", e)))?;

        let backend = Self {
            client,
            config,
            session: RwLock::new(None),
            containers: DashSet::new(),
        };

        backend
            .authenticate()
            .await
            .map_err(|e| StorageError::Config(format!("swift authentication failed: {}", e)))?;
        Ok(backend)
    }

    async fn authenticate(&self) -> Result<Arc<Session>, StorageError> {
        let resp = self
            .client
            .get(&self.config.address)
            .header("X-Auth-User", &self.config.username)
            .header("X-Auth-Key", &self.config.password)
            .send()
            .await
            .map_err(|e| transport_error("swift auth", e))?;

        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "swift auth"));
        }

        let header = |name: &str| -> Result<String, StorageError> {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StorageError::Backend(format!("swift auth response missing {}", name)))
        };
        let session = Arc::new(Session {
            storage_url: header("X-Storage-Url")?.trim_end_matches('/').to_string(),
            token: header("X-Auth-Token")?,
        });

        info!(storage_url = %session.storage_url, "Authenticated against swift");
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    async fn current_session(&self) -> Result<Arc<Session>, StorageError> {
        let cached = self.session.read().clone();
        match cached {
            Some(session) => Ok(session),
            None => self.authenticate().await,
        }
    }

    fn container(&self, item_type: ItemType) -> String {
        format!("{}{}", self.config.container_prefix, item_type.as_str())
    }

    /// Send `method` to `{storage_url}/{path}`, re-authenticating once on 401.
    async fn send(&self, method: Method, path: &str, body: Option<&[u8]>) -> Result<Response, StorageError> {
        let session = self.current_session().await?;
        let resp = self.send_with(&session, method.clone(), path, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        warn!(path = %path, "Swift token rejected, re-authenticating");
        *self.session.write() = None;
        let session = self.authenticate().await?;
        self.send_with(&session, method, path, body).await
    }

    async fn send_with(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Response, StorageError> {
        let url = format!("{}/{}", session.storage_url, path);
        // Only transport failures are retried here; HTTP statuses are the caller's.
        retry("swift_request", &RetryConfig::query(), || {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-Auth-Token", &session.token);
            if let Some(body) = body {
                request = request.body(body.to_vec());
            }
            request.send()
        })
        .await
        .map_err(|e| transport_error(path, e))
    }

    async fn ensure_container(&self, item_type: ItemType) -> Result<(), StorageError> {
        if self.containers.contains(&item_type) {
            return Ok(());
        }
        let container = self.container(item_type);
        let resp = self.send(Method::PUT, &container, None).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &format!("creating container {}", container)));
        }
        debug!(container = %container, "Swift container ready");
        self.containers.insert(item_type);
        Ok(())
    }
}

#[async_trait]
impl UnitBackend for SwiftBackend {
    fn kind(&self) -> &'static str {
        "swift"
    }

    async fn put_object(&self, item_type: ItemType, locator: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.ensure_container(item_type).await?;
        let path = format!("{}/{}", self.container(item_type), locator);
        let resp = self.send(Method::PUT, &path, Some(&data)).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &path));
        }
        Ok(())
    }

    async fn get_object(&self, item_type: ItemType, locator: &str) -> Result<Vec<u8>, StorageError> {
        let path = format!("{}/{}", self.container(item_type), locator);
        let resp = self.send(Method::GET, &path, None).await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &path));
        }
        let bytes = resp.bytes().await.map_err(|e| transport_error(&path, e))?;
        Ok(bytes.to_vec())
    }

    async fn object_exists(&self, item_type: ItemType, locator: &str) -> Result<bool, StorageError> {
        let path = format!("{}/{}", self.container(item_type), locator);
        let resp = self.send(Method::HEAD, &path, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(s, &path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ACCOUNT: &str = "/v1/AUTH_test";

    fn config(server: &MockServer) -> SwiftStorageConfig {
        SwiftStorageConfig {
            address: format!("{}/auth/v1.0", server.uri()),
            username: "tester".into(),
            password: "testing".into(),
            container_prefix: "cdn-".into(),
            timeout_secs: 5,
        }
    }

    fn auth_ok(server: &MockServer, token: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("X-Storage-Url", format!("{}{}", server.uri(), ACCOUNT).as_str())
            .insert_header("X-Auth-Token", token)
    }

    async fn mount_auth(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .and(header("X-Auth-User", "tester"))
            .and(header("X-Auth-Key", "testing"))
            .respond_with(auth_ok(server, "tok-1"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_put_get_exists() {
        let server = MockServer::start().await;
        mount_auth(&server).await;

        Mock::given(method("PUT"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog")))
            .and(header("X-Auth-Token", "tok-1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sealed".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/missing")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = SwiftBackend::init(config(&server)).await.unwrap();
        backend.put_object(ItemType::StepLog, "abc", b"sealed".to_vec()).await.unwrap();
        // container is created only once
        backend.put_object(ItemType::StepLog, "abc", b"sealed".to_vec()).await.unwrap();

        assert_eq!(backend.get_object(ItemType::StepLog, "abc").await.unwrap(), b"sealed");
        assert!(backend.object_exists(ItemType::StepLog, "abc").await.unwrap());
        assert!(!backend.object_exists(ItemType::StepLog, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("GET"))
            .and(path(format!("{ACCOUNT}/cdn-ServiceLog/nope")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = SwiftBackend::init(config(&server)).await.unwrap();
        let err = backend.get_object(ItemType::ServiceLog, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expired_token_reauthenticates_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(auth_ok(&server, "tok-1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(auth_ok(&server, "tok-2"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .and(header("X-Auth-Token", "tok-1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .and(header("X-Auth-Token", "tok-2"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let backend = SwiftBackend::init(config(&server)).await.unwrap();
        assert!(backend.object_exists(ItemType::StepLog, "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoked_credentials_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(auth_ok(&server, "tok-1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let backend = SwiftBackend::init(config(&server)).await.unwrap();
        let err = backend.get_object(ItemType::StepLog, "abc").await.unwrap_err();
        assert!(err.is_fatal(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        Mock::given(method("HEAD"))
            .and(path(format!("{ACCOUNT}/cdn-StepLog/abc")))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = SwiftBackend::init(config(&server)).await.unwrap();
        let err = backend.object_exists(ItemType::StepLog, "abc").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_init_with_bad_credentials_is_config_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1.0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = SwiftBackend::init(config(&server)).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_init_requires_credentials() {
        let err = SwiftBackend::init(SwiftStorageConfig {
            address: "http://localhost/auth".into(),
            username: String::new(),
            password: "x".into(),
            container_prefix: String::new(),
            timeout_secs: 5,
        })
        .await
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let cfg: SwiftStorageConfig = serde_json::from_value(serde_json::json!({
            "address": "http://swift/auth/v1.0",
            "username": "u",
            "password": "hunter2"
        }))
        .unwrap();
        assert_eq!(cfg.timeout_secs, 30);
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
