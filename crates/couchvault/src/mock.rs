//! In-memory [`Transport`] with canned responses, for engine unit tests.

use crate::client::{CouchResponse, Transport};
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Vec<u8>>,
}

impl RecordedRequest {
    pub fn body_json(&self) -> Value {
        serde_json::from_slice(self.body.as_deref().unwrap_or(b"null")).unwrap()
    }
}

#[derive(Debug, Clone)]
enum Route {
    Respond(u16, Bytes),
    Fail,
}

#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) -> &Self {
        self.respond_raw(method, path, status, body.to_string().into_bytes())
    }

    pub fn respond_raw(&self, method: Method, path: &str, status: u16, body: Vec<u8>) -> &Self {
        self.routes.lock().unwrap().insert(
            (method, path.to_string()),
            Route::Respond(status, Bytes::from(body)),
        );
        self
    }

    pub fn fail(&self, method: Method, path: &str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), Route::Fail);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<CouchResponse, ClientError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: method.clone(),
            path: path.to_string(),
            body,
        });

        let route = self
            .routes
            .lock()
            .unwrap()
            .get(&(method.clone(), path.to_string()))
            .cloned();

        match route {
            Some(Route::Respond(status, body)) => Ok(CouchResponse {
                path: path.to_string(),
                status,
                body,
            }),
            Some(Route::Fail) => Err(ClientError::Transport {
                method: method.to_string(),
                path: path.to_string(),
                msg: "operation timed out".to_string(),
            }),
            None => Ok(CouchResponse {
                path: path.to_string(),
                status: 404,
                body: Bytes::from_static(br#"{"error":"not_found","reason":"missing"}"#),
            }),
        }
    }
}
