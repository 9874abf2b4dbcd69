//! Install request progress and what each reported state means.

use serde::Deserialize;
use serde_json::Value;

pub const COMPLETED: &str = "COMPLETED";
pub const TIMEDOUT: &str = "TIMEDOUT";
pub const PENDING: &str = "PENDING";
pub const IN_PROGRESS: &str = "IN_PROGRESS";

/// One observation of a tracked install request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Progress {
    #[serde(rename = "request_status")]
    pub status: String,
    #[serde(rename = "progress_percent")]
    pub percent: f64,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Requests")]
    requests: Progress,
}

impl Progress {
    /// Read `{"Requests": {"progress_percent", "request_status"}}`.
    pub fn from_response(body: &Value) -> Option<Self> {
        Envelope::deserialize(body).ok().map(|e| e.requests)
    }

    /// Classify this observation.
    ///
    /// Unrecognised statuses are failures unless the request got at least
    /// `grace_percent` of the way through.
    pub fn verdict(&self, grace_percent: f64) -> Verdict {
        match self.status.as_str() {
            COMPLETED => Verdict::Completed,
            TIMEDOUT => Verdict::Retry,
            PENDING | IN_PROGRESS => Verdict::Running,
            _ if self.percent >= grace_percent => Verdict::NearlyComplete,
            _ => Verdict::Failed,
        }
    }
}

/// What the poll loop does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still running; keep polling.
    Running,
    /// The service timed out answering; poll again.
    Retry,
    Completed,
    /// A failure status past the grace threshold, accepted with a warning.
    NearlyComplete,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn progress(status: &str, percent: f64) -> Progress {
        Progress {
            status: status.to_string(),
            percent,
        }
    }

    #[test]
    fn completed_is_success() {
        assert_eq!(progress("COMPLETED", 100.0).verdict(95.0), Verdict::Completed);
    }

    #[test]
    fn failure_past_grace_is_accepted() {
        assert_eq!(progress("FAILED", 96.0).verdict(95.0), Verdict::NearlyComplete);
        assert_eq!(progress("ABORTED", 95.0).verdict(95.0), Verdict::NearlyComplete);
    }

    #[test]
    fn failure_below_grace_is_fatal() {
        assert_eq!(progress("FAILED", 40.0).verdict(95.0), Verdict::Failed);
    }

    #[test]
    fn running_states_keep_polling() {
        for status in ["IN_PROGRESS", "PENDING", "TIMEDOUT"] {
            let verdict = progress(status, 50.0).verdict(95.0);
            assert!(matches!(verdict, Verdict::Running | Verdict::Retry), "{status}");
        }
        // Below-grace percent is irrelevant while running.
        assert_eq!(progress("IN_PROGRESS", 10.0).verdict(95.0), Verdict::Running);
        assert_eq!(progress("TIMEDOUT", 10.0).verdict(95.0), Verdict::Retry);
    }

    #[test]
    fn parses_request_envelope() {
        let body = json!({
            "href": "https://10.0.0.1:8443/api/v1/clusters/analytics-stack/requests/1",
            "Requests": { "id": 1, "progress_percent": 62.5, "request_status": "IN_PROGRESS" },
        });
        assert_eq!(Progress::from_response(&body), Some(progress("IN_PROGRESS", 62.5)));
        assert_eq!(Progress::from_response(&json!({"Requests": {}})), None);
    }
}
