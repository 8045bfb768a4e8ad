//! Per-request timing and outcome record.
//!
//! Durations are always derived: setting an end timestamp recomputes the
//! matching duration, and a duration stays `-1` until both ends are known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetric {
    request_start: Option<DateTime<Utc>>,
    request_end: Option<DateTime<Utc>>,
    request_duration: i64,
    service_start: Option<DateTime<Utc>>,
    service_end: Option<DateTime<Utc>>,
    service_duration: i64,

    pub url: String,
    pub resource: String,
    pub method: String,
    pub response_code: u16,
    pub response_message: String,

    pub failure: bool,
    pub failure_code: u32,
    pub failure_reason: Option<String>,
    pub error: bool,
    pub error_message: Option<String>,

    pub service_org_id: String,
    pub service_id: String,
    pub service_version: String,
    pub application_org_id: Option<String>,
    pub application_id: Option<String>,
    pub application_version: Option<String>,
    pub plan_id: Option<String>,
    /// Redacted API key of the resolved contract
    pub contract_id: Option<String>,

    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl Default for RequestMetric {
    fn default() -> Self {
        Self {
            request_start: None,
            request_end: None,
            request_duration: -1,
            service_start: None,
            service_end: None,
            service_duration: -1,
            url: String::new(),
            resource: String::new(),
            method: String::new(),
            response_code: 0,
            response_message: String::new(),
            failure: false,
            failure_code: 0,
            failure_reason: None,
            error: false,
            error_message: None,
            service_org_id: String::new(),
            service_id: String::new(),
            service_version: String::new(),
            application_org_id: None,
            application_id: None,
            application_version: None,
            plan_id: None,
            contract_id: None,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
        }
    }
}

fn millis_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> i64 {
    match (start, end) {
        (Some(start), Some(end)) => (end - start).num_milliseconds(),
        _ => -1,
    }
}

impl RequestMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_start(&self) -> Option<DateTime<Utc>> {
        self.request_start
    }

    pub fn request_end(&self) -> Option<DateTime<Utc>> {
        self.request_end
    }

    /// Milliseconds, or -1 until both ends are set
    pub fn request_duration(&self) -> i64 {
        self.request_duration
    }

    pub fn service_start(&self) -> Option<DateTime<Utc>> {
        self.service_start
    }

    pub fn service_end(&self) -> Option<DateTime<Utc>> {
        self.service_end
    }

    pub fn service_duration(&self) -> i64 {
        self.service_duration
    }

    pub fn set_request_start(&mut self, at: DateTime<Utc>) {
        self.request_start = Some(at);
        self.request_duration = millis_between(self.request_start, self.request_end);
    }

    pub fn set_request_end(&mut self, at: DateTime<Utc>) {
        self.request_end = Some(at);
        self.request_duration = millis_between(self.request_start, self.request_end);
    }

    pub fn set_service_start(&mut self, at: DateTime<Utc>) {
        self.service_start = Some(at);
        self.service_duration = millis_between(self.service_start, self.service_end);
    }

    pub fn set_service_end(&mut self, at: DateTime<Utc>) {
        self.service_end = Some(at);
        self.service_duration = millis_between(self.service_start, self.service_end);
    }

    /// Mark the call as stopped by a policy
    pub fn record_failure(&mut self, failure_code: u32, reason: &str) {
        self.failure = true;
        self.failure_code = failure_code;
        self.failure_reason = Some(reason.to_string());
    }

    /// Mark the call as failed by the gateway or backend
    pub fn record_error(&mut self, message: &str) {
        self.error = true;
        self.error_message = Some(message.to_string());
    }

    pub fn outcome(&self) -> &'static str {
        if self.error {
            "error"
        } else if self.failure {
            "failure"
        } else {
            "success"
        }
    }
}
