//! forge-http — JSON transport shared by the cloud and install clients.
//!
//! API clients talk to a `JsonTransport`; `HttpClient` is the hyper/rustls
//! implementation and `testing::MockTransport` a scripted one.

pub mod client;
pub mod error;
pub mod testing;

use async_trait::async_trait;
use serde_json::Value;

pub use client::{ClientBuilder, HttpClient, TlsMode};
pub use error::{HttpError, HttpResult};
pub use http::Method;

/// Send a JSON request and decode the JSON reply.
///
/// Any status of 400 or above is an error. An empty or non-JSON body on a
/// successful response yields `Ok(None)`.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> HttpResult<Option<Value>>;
}

#[async_trait]
impl<T: JsonTransport + ?Sized> JsonTransport for std::sync::Arc<T> {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> HttpResult<Option<Value>> {
        (**self).send(method, url, body).await
    }
}
