//! HTTP access to the database server.
//!
//! [`Transport`] is the seam: production code goes through [`HttpTransport`]
//! (reqwest), tests plug in an in-memory implementation. [`Couch`] builds the
//! typed requests on top and hands back the raw status and body, leaving the
//! decision about what a status means to the dump and restore engines.

use crate::config::VaultConfig;
use crate::error::{ClientError, ConfigError};
use crate::paths::encode_segment;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Status and body of one completed request.
#[derive(Debug, Clone)]
pub struct CouchResponse {
    pub path: String,
    pub status: u16,
    pub body: Bytes,
}

impl CouchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_slice(&self.body).map_err(|source| ClientError::InvalidJson {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request. `path` is relative to the server root and already encoded.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<CouchResponse, ClientError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &VaultConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<CouchResponse, ClientError> {
        let transport_error = |msg: String| ClientError::Transport {
            method: method.to_string(),
            path: path.to_string(),
            msg,
        };

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(ACCEPT, "*/*");
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(format!("read error: {}", e)))?;

        Ok(CouchResponse {
            path: path.to_string(),
            status,
            body,
        })
    }
}

/// Query options for a document fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentQuery {
    /// `revs=true&revs_info=true`
    pub revisions: bool,
    /// `attachments=true`
    pub attachments: bool,
}

/// Typed requests against one server. Cloning shares the transport.
#[derive(Clone)]
pub struct Couch {
    transport: Arc<dyn Transport>,
}

impl Couch {
    pub fn new(config: &VaultConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_transport(Arc::new(HttpTransport::new(config)?)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn get(&self, path: String) -> Result<CouchResponse, ClientError> {
        self.transport.send(Method::GET, &path, None).await
    }

    pub async fn all_dbs(&self) -> Result<CouchResponse, ClientError> {
        self.get("/_all_dbs".to_string()).await
    }

    pub async fn all_docs(&self, db: &str) -> Result<CouchResponse, ClientError> {
        self.get(format!("/{}/_all_docs", encode_segment(db))).await
    }

    pub async fn database_info(&self, db: &str) -> Result<CouchResponse, ClientError> {
        self.get(format!("/{}", encode_segment(db))).await
    }

    pub async fn create_database(&self, db: &str) -> Result<CouchResponse, ClientError> {
        self.transport
            .send(Method::PUT, &format!("/{}", encode_segment(db)), None)
            .await
    }

    pub async fn delete_database(&self, db: &str) -> Result<CouchResponse, ClientError> {
        self.transport
            .send(Method::DELETE, &format!("/{}", encode_segment(db)), None)
            .await
    }

    pub async fn fetch_document(
        &self,
        db: &str,
        id: &str,
        query: DocumentQuery,
    ) -> Result<CouchResponse, ClientError> {
        let mut params = Vec::new();
        if query.revisions {
            params.push("revs=true");
            params.push("revs_info=true");
        }
        if query.attachments {
            params.push("attachments=true");
        }

        let mut path = format!("/{}/{}", encode_segment(db), encode_segment(id));
        if !params.is_empty() {
            path.push('?');
            path.push_str(&params.join("&"));
        }
        self.get(path).await
    }

    pub async fn fetch_revision(
        &self,
        db: &str,
        id: &str,
        rev: &str,
        attachments: bool,
    ) -> Result<CouchResponse, ClientError> {
        let mut path = format!(
            "/{}/{}?revs=true&rev={}",
            encode_segment(db),
            encode_segment(id),
            encode_segment(rev)
        );
        if attachments {
            path.push_str("&attachments=true");
        }
        self.get(path).await
    }

    pub async fn fetch_attachment(
        &self,
        db: &str,
        id: &str,
        name: &str,
    ) -> Result<CouchResponse, ClientError> {
        self.get(format!(
            "/{}/{}/{}",
            encode_segment(db),
            encode_segment(id),
            encode_segment(name)
        ))
        .await
    }

    pub async fn put_document(
        &self,
        db: &str,
        id: &str,
        body: Vec<u8>,
    ) -> Result<CouchResponse, ClientError> {
        let path = format!("/{}/{}", encode_segment(db), encode_segment(id));
        self.transport.send(Method::PUT, &path, Some(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_document_query_strings() {
        let mock = Arc::new(MockTransport::new());
        let couch = Couch::with_transport(mock.clone());

        couch
            .fetch_document("db", "a", DocumentQuery::default())
            .await
            .unwrap();
        couch
            .fetch_document(
                "db",
                "a",
                DocumentQuery {
                    revisions: true,
                    attachments: true,
                },
            )
            .await
            .unwrap();
        couch
            .fetch_document(
                "db",
                "a",
                DocumentQuery {
                    revisions: false,
                    attachments: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            mock.request_paths(),
            vec![
                "GET /db/a",
                "GET /db/a?revs=true&revs_info=true&attachments=true",
                "GET /db/a?attachments=true",
            ]
        );
    }

    #[tokio::test]
    async fn test_paths_are_percent_encoded() {
        let mock = Arc::new(MockTransport::new());
        let couch = Couch::with_transport(mock.clone());

        couch
            .fetch_revision("my db", "_design/app", "2-ab", false)
            .await
            .unwrap();
        couch
            .fetch_attachment("db", "doc", "report 2024.pdf")
            .await
            .unwrap();

        assert_eq!(
            mock.request_paths(),
            vec![
                "GET /my%20db/_design%2Fapp?revs=true&rev=2-ab",
                "GET /db/doc/report%202024.pdf",
            ]
        );
    }

    #[tokio::test]
    async fn test_database_verbs() {
        let mock = Arc::new(MockTransport::new());
        let couch = Couch::with_transport(mock.clone());

        couch.database_info("db").await.unwrap();
        couch.create_database("db").await.unwrap();
        couch.delete_database("db").await.unwrap();
        couch.put_document("db", "a", b"{}".to_vec()).await.unwrap();

        assert_eq!(
            mock.request_paths(),
            vec!["GET /db", "PUT /db", "DELETE /db", "PUT /db/a"]
        );
        assert_eq!(mock.requests()[3].body.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_unrouted_request_is_not_found() {
        let mock = Arc::new(MockTransport::new());
        let couch = Couch::with_transport(mock);

        let response = couch.all_dbs().await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_error() {
        let mock = Arc::new(MockTransport::new());
        mock.fail(Method::GET, "/_all_dbs");
        let couch = Couch::with_transport(mock);

        let err = couch.all_dbs().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[test]
    fn test_response_json() {
        let response = CouchResponse {
            path: "/db".to_string(),
            status: 200,
            body: Bytes::from_static(br#"{"doc_count":3}"#),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value, json!({"doc_count": 3}));

        let broken = CouchResponse {
            body: Bytes::from_static(b"<html>"),
            ..response
        };
        assert!(matches!(
            broken.json::<serde_json::Value>(),
            Err(ClientError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_http_transport_builds_from_config() {
        let transport = HttpTransport::new(&VaultConfig::default()).unwrap();
        assert_eq!(transport.base_url, "http://localhost:5984");
    }
}
