//! Admission context: one per upgrade request.
//!
//! Middleware runs before the WebSocket upgrade completes, so the context
//! exposes the request side (method, URI, headers, query) plus a
//! thread-safe key/value store middleware can use to hand data forward --
//! e.g. a user record parsed from the token -- which stays readable from
//! the connection for its whole lifetime.

use axum::http::{HeaderMap, Method, Uri};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct Context {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    query: HashMap<String, String>,
    store: RwLock<HashMap<String, Value>>,
}

impl Context {
    pub(crate) fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let mut query = HashMap::new();
        if let Some(raw) = uri.query() {
            // First value per key wins.
            for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
        }
        Context {
            method,
            uri,
            headers,
            query,
            store: RwLock::new(HashMap::new()),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decoded query parameters, first value per key.
    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Read a value a middleware stored earlier in the chain.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.read().unwrap().get(key).cloned()
    }

    /// Store a value for later middleware or for handlers reading the
    /// connection's context.
    pub fn set(&self, key: &str, value: Value) {
        self.store.write().unwrap().insert(key.to_owned(), value);
    }
}
