//! Scripted `JsonTransport` for exercising API clients without a server.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use http::Method;
use serde_json::Value;

use crate::error::{HttpError, HttpResult};
use crate::JsonTransport;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(Value),
    Empty,
    Status(u16, String),
    /// A body that is not the expected shape.
    Malformed,
    /// Connection refused before any response.
    Refused,
}

impl MockReply {
    fn into_result(self, method: &Method, url: &str) -> HttpResult<Option<Value>> {
        match self {
            MockReply::Json(v) => Ok(Some(v)),
            MockReply::Empty => Ok(None),
            MockReply::Status(status, body) => Err(HttpError::Status {
                method: method.to_string(),
                url: url.to_string(),
                status,
                reason: String::new(),
                body,
            }),
            MockReply::Malformed => Err(HttpError::malformed(url, "truncated body")),
            MockReply::Refused => Err(HttpError::Connect {
                url: url.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

#[derive(Debug)]
struct Route {
    method: Method,
    suffix: String,
    replies: VecDeque<MockReply>,
}

/// Routes requests by method and URL suffix to queued replies.
///
/// Replies for a route are served in order; the last one repeats. A
/// request with no matching route gets a 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for requests whose URL ends with `suffix`.
    pub fn on(&self, method: Method, suffix: &str, reply: MockReply) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        match routes
            .iter_mut()
            .find(|r| r.method == method && r.suffix == suffix)
        {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                suffix: suffix.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    pub fn on_json(&self, method: Method, suffix: &str, body: Value) -> &Self {
        self.on(method, suffix, MockReply::Json(body))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of requests sent with `method` to a URL ending in `suffix`.
    pub fn count(&self, method: &Method, suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| &r.method == method && r.url.ends_with(suffix))
            .count()
    }

    fn next_reply(&self, method: &Method, url: &str) -> MockReply {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let route = routes
            .iter_mut()
            .filter(|r| &r.method == method && url.ends_with(&r.suffix))
            .max_by_key(|r| r.suffix.len());
        match route {
            Some(route) if route.replies.len() > 1 => route
                .replies
                .pop_front()
                .unwrap_or(MockReply::Empty),
            Some(route) => route.replies.front().cloned().unwrap_or(MockReply::Empty),
            None => MockReply::Status(404, format!("no mock route for {method} {url}")),
        }
    }
}

#[async_trait]
impl JsonTransport for MockTransport {
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> HttpResult<Option<Value>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedRequest {
                method: method.clone(),
                url: url.to_string(),
                body: body.cloned(),
            });
        self.next_reply(&method, url).into_result(&method, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replies_in_order_then_repeat_last() {
        let mock = MockTransport::new();
        mock.on(Method::GET, "/status", MockReply::Malformed)
            .on_json(Method::GET, "/status", json!({"n": 1}));

        assert!(mock.send(Method::GET, "https://h/status", None).await.is_err());
        for _ in 0..3 {
            let reply = mock.send(Method::GET, "https://h/status", None).await.unwrap();
            assert_eq!(reply, Some(json!({"n": 1})));
        }
        assert_eq!(mock.count(&Method::GET, "/status"), 4);
    }

    #[tokio::test]
    async fn unmatched_route_is_not_found() {
        let mock = MockTransport::new();
        let err = mock.send(Method::DELETE, "https://h/x", None).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn longest_suffix_wins() {
        let mock = MockTransport::new();
        mock.on_json(Method::GET, "/servers", json!("short"))
            .on_json(Method::GET, "/os-floating-ips/servers", json!("long"));
        let reply = mock
            .send(Method::GET, "https://h/os-floating-ips/servers", None)
            .await
            .unwrap();
        assert_eq!(reply, Some(json!("long")));
    }
}
