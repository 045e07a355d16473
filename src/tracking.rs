use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::TaskStatus;
use crate::error::CampaignError;

pub const DEFAULT_MONITOR_URL: &str = "https://bigpanda.cern.ch";
pub const DEFAULT_SERVER_URL: &str = "https://pandaserver.cern.ch:25443/server/panda";

/// One task as reported by the tracking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: u64,
    pub task_name: String,
    pub status: TaskStatus,
    /// Output dataset names with trailing `/` removed.
    #[serde(default)]
    pub output_datasets: Vec<String>,
    #[serde(default)]
    pub statistics: Option<String>,
}

impl TaskDescriptor {
    /// Build a descriptor from the comma-separated output dataset field.
    pub fn new(task_id: u64, task_name: &str, status: TaskStatus, output_field: &str) -> Self {
        Self {
            task_id,
            task_name: task_name.to_string(),
            status,
            output_datasets: split_output_field(output_field),
            statistics: None,
        }
    }
}

pub fn split_output_field(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(|name| name.trim().trim_matches('/'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Response of one task query. A non-zero `status_code` means the service
/// rejected the query and `tasks` must not be trusted.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub status_code: i64,
    pub tasks: BTreeMap<u64, TaskDescriptor>,
}

pub trait TrackingClient: Send + Sync {
    fn query_tasks(&self, identity: &str, since: DateTime<Utc>)
    -> Result<TaskQuery, CampaignError>;
    fn retry(&self, task_id: u64) -> Result<(), CampaignError>;
    fn kill(&self, task_id: u64) -> Result<(), CampaignError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEndpoints {
    pub monitor_url: String,
    pub server_url: String,
}

impl Default for TrackingEndpoints {
    fn default() -> Self {
        Self {
            monitor_url: DEFAULT_MONITOR_URL.to_string(),
            server_url: DEFAULT_SERVER_URL.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct PandaHttpClient {
    client: Client,
    endpoints: TrackingEndpoints,
}

impl PandaHttpClient {
    pub fn new(endpoints: TrackingEndpoints) -> Result<Self, CampaignError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("gcm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CampaignError::TrackingHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| CampaignError::TrackingHttp(err.to_string()))?;
        Ok(Self { client, endpoints })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, CampaignError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: u32 = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0u32;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        debug!(status, attempt, "retrying tracking request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS << attempt));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        debug!(error = %err, attempt, "retrying tracking request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS << attempt));
                        attempt += 1;
                        continue;
                    }
                    return Err(CampaignError::TrackingHttp(err.to_string()));
                }
            }
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, CampaignError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "tracking request failed".to_string());
        Err(CampaignError::TrackingStatus { status, message })
    }

    fn task_command(&self, command: &str, task_id: u64) -> Result<(), CampaignError> {
        let url = format!("{}/{command}", self.endpoints.server_url.trim_end_matches('/'));
        let form = [("jediTaskID", task_id.to_string())];
        let response = self.send_with_retries(|| self.client.post(&url).form(&form))?;
        Self::handle_status(response)?;
        Ok(())
    }
}

impl TrackingClient for PandaHttpClient {
    fn query_tasks(
        &self,
        identity: &str,
        since: DateTime<Utc>,
    ) -> Result<TaskQuery, CampaignError> {
        let url = format!("{}/tasks/", self.endpoints.monitor_url.trim_end_matches('/'));
        let since = since.format("%Y-%m-%d").to_string();
        let query = [
            ("username", identity),
            ("datetime_from", since.as_str()),
            ("json", "1"),
        ];
        let response = self.send_with_retries(|| self.client.get(&url).query(&query))?;
        let response = Self::handle_status(response)?;
        let raw: Value = response
            .json()
            .map_err(|err| CampaignError::TrackingHttp(err.to_string()))?;
        Ok(parse_task_listing(&raw))
    }

    fn retry(&self, task_id: u64) -> Result<(), CampaignError> {
        self.task_command("retryTask", task_id)
    }

    fn kill(&self, task_id: u64) -> Result<(), CampaignError> {
        self.task_command("killTask", task_id)
    }
}

/// Interpret a monitor task listing. Listings that are neither an array nor
/// an object carrying a `tasks` array yield a non-zero status code.
pub fn parse_task_listing(raw: &Value) -> TaskQuery {
    let items = match raw {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("tasks").and_then(Value::as_array) {
            Some(items) => items,
            None => {
                let code = map.get("code").and_then(Value::as_i64).unwrap_or(1);
                return TaskQuery {
                    status_code: if code == 0 { 1 } else { code },
                    tasks: BTreeMap::new(),
                };
            }
        },
        _ => {
            return TaskQuery {
                status_code: 1,
                tasks: BTreeMap::new(),
            };
        }
    };

    let mut tasks = BTreeMap::new();
    for item in items {
        match parse_task(item) {
            Some(task) => {
                tasks.insert(task.task_id, task);
            }
            None => warn!(entry = %item, "skipping task entry without id or name"),
        }
    }
    TaskQuery {
        status_code: 0,
        tasks,
    }
}

fn parse_task(item: &Value) -> Option<TaskDescriptor> {
    let task_id = item
        .get("jeditaskid")
        .or_else(|| item.get("jediTaskID"))
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))?;
    let task_name = item
        .get("taskname")
        .or_else(|| item.get("taskName"))
        .and_then(Value::as_str)?;
    let status = item
        .get("status")
        .and_then(Value::as_str)
        .map(TaskStatus::from)
        .unwrap_or_default();

    let output_datasets = match item.get("outDS").and_then(Value::as_str) {
        Some(field) => split_output_field(field),
        None => item
            .get("datasets")
            .and_then(Value::as_array)
            .map(|datasets| {
                datasets
                    .iter()
                    .filter(|ds| ds.get("type").and_then(Value::as_str) == Some("output"))
                    .filter_map(|ds| ds.get("datasetname").and_then(Value::as_str))
                    .flat_map(split_output_field)
                    .collect()
            })
            .unwrap_or_default(),
    };

    let statistics = item
        .get("dsinfo")
        .filter(|value| !value.is_null())
        .map(|value| value.to_string());

    Some(TaskDescriptor {
        task_id,
        task_name: task_name.to_string(),
        status,
        output_datasets,
        statistics,
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
