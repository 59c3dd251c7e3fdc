//! REST client for the engine's external-task endpoints.
//!
//! Wraps `POST /external-task/fetchAndLock` and the per-task
//! `complete`, `bpmnError`, `failure` and `extendLock` calls using
//! [`reqwest`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{EngineAuth, EngineConfig};
use crate::domain::variables::WireValue;
use crate::domain::{BusinessError, ExternalTask, Failure, TaskId, Variables, WorkerId};
use crate::error::LatchError;
use crate::ports::{EngineGateway, FetchRequest};

/// Added to the long-poll budget so the engine answers before we give up.
const FETCH_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Engine timestamp format, e.g. `2015-10-06T16:34:42.000+0200`.
const ENGINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchAndLockBody<'a> {
    worker_id: &'a str,
    max_tasks: u32,
    use_priority: bool,
    async_response_timeout: u64,
    topics: Vec<TopicBody<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicBody<'a> {
    topic_name: &'a str,
    lock_duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id_in: Option<Vec<&'a str>>,
}

/// One element of the fetch-and-lock response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockedTaskDto {
    id: String,
    topic_name: String,
    worker_id: Option<String>,
    lock_expiration_time: Option<String>,
    retries: Option<u32>,
    #[serde(default)]
    variables: BTreeMap<String, WireValue>,
    business_key: Option<String>,
    process_instance_id: Option<String>,
    activity_id: Option<String>,
    tenant_id: Option<String>,
    #[serde(default)]
    priority: i64,
    error_message: Option<String>,
}

/// Error body the engine sends with non-2xx answers.
#[derive(Debug, Deserialize)]
struct EngineErrorDto {
    message: Option<String>,
}

/// HTTP gateway to one engine REST API.
pub struct RestGateway {
    client: reqwest::Client,
    config: EngineConfig,
    closed: AtomicBool,
}

impl RestGateway {
    pub fn new(config: EngineConfig) -> Result<Self, LatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn ensure_open(&self) -> Result<(), LatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LatchError::Closed);
        }
        Ok(())
    }

    fn post(&self, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(format!("{}{}", self.config.base_url, path))
            .timeout(timeout);
        match &self.config.auth {
            EngineAuth::None => request,
            EngineAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            EngineAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// `POST /external-task/{id}/{action}` with no response body.
    async fn post_task_action(
        &self,
        task_id: &TaskId,
        action: &str,
        body: serde_json::Value,
    ) -> Result<(), LatchError> {
        self.ensure_open()?;
        let response = self
            .post(
                &format!("/external-task/{task_id}/{action}"),
                self.config.request_timeout,
            )
            .json(&body)
            .send()
            .await?;
        Self::ensure_success(response, Some(task_id)).await?;
        Ok(())
    }

    fn fetch_body<'a>(&'a self, request: &'a FetchRequest) -> FetchAndLockBody<'a> {
        let tenant_id_in = self.config.tenant_id.as_deref().map(|t| vec![t]);
        FetchAndLockBody {
            worker_id: request.worker_id.as_str(),
            max_tasks: request.max_tasks,
            use_priority: true,
            async_response_timeout: millis(request.async_response_timeout),
            topics: request
                .topics
                .iter()
                .map(|topic| TopicBody {
                    topic_name: topic,
                    lock_duration: millis(request.lock_duration),
                    tenant_id_in: tenant_id_in.clone(),
                })
                .collect(),
        }
    }

    /// Map a non-2xx answer to the matching error.
    ///
    /// 404 means the task is gone. A 400/500 whose message talks about the
    /// lock or the worker means someone else holds it now.
    async fn ensure_success(
        response: reqwest::Response,
        task_id: Option<&TaskId>,
    ) -> Result<reqwest::Response, LatchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        let message = serde_json::from_str::<EngineErrorDto>(&body)
            .ok()
            .and_then(|dto| dto.message)
            .unwrap_or(body);

        let Some(task_id) = task_id else {
            return Err(LatchError::Engine {
                status: status.as_u16(),
                message,
            });
        };

        let lowered = message.to_lowercase();
        match status.as_u16() {
            404 => Err(LatchError::NotFound {
                task_id: task_id.clone(),
            }),
            400 | 500 if lowered.contains("lock") || lowered.contains("worker") => {
                Err(LatchError::LockExpired {
                    task_id: task_id.clone(),
                })
            }
            code => Err(LatchError::Engine {
                status: code,
                message,
            }),
        }
    }

    fn into_task(dto: LockedTaskDto, request: &FetchRequest, local_expiry: DateTime<Utc>) -> ExternalTask {
        let task_id = TaskId::new(dto.id);

        let (variables, rejected) = Variables::from_wire(dto.variables);
        for e in rejected {
            tracing::warn!(task_id = %task_id, error = %e, "dropping unsupported variable");
        }

        // ローカル時計の見積もりより長くは信用しない
        let lock_expiration = dto
            .lock_expiration_time
            .as_deref()
            .and_then(parse_engine_timestamp)
            .map_or(local_expiry, |engine| engine.min(local_expiry));

        ExternalTask {
            id: task_id,
            topic: dto.topic_name,
            worker_id: dto
                .worker_id
                .map(WorkerId::new)
                .unwrap_or_else(|| request.worker_id.clone()),
            lock_expiration,
            retries: dto.retries,
            variables,
            business_key: dto.business_key,
            process_instance_id: dto.process_instance_id,
            activity_id: dto.activity_id,
            tenant_id: dto.tenant_id,
            priority: dto.priority,
            error_message: dto.error_message,
        }
    }
}

#[async_trait]
impl EngineGateway for RestGateway {
    async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<ExternalTask>, LatchError> {
        request.validate()?;
        self.ensure_open()?;

        let response = self
            .post(
                "/external-task/fetchAndLock",
                request.async_response_timeout + FETCH_TIMEOUT_MARGIN,
            )
            .json(&self.fetch_body(request))
            .send()
            .await?;
        let response = Self::ensure_success(response, None).await?;

        let body = response.text().await?;
        let dtos: Vec<LockedTaskDto> =
            serde_json::from_str(&body).map_err(|e| LatchError::Decode(e.to_string()))?;

        // ロックはエンジンが応答した時点で付与される。long poll の開始時刻で見積もらない
        let received_at = Utc::now();
        let local_expiry = chrono::Duration::from_std(request.lock_duration)
            .ok()
            .and_then(|d| received_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(dtos
            .into_iter()
            .map(|dto| Self::into_task(dto, request, local_expiry))
            .collect())
    }

    async fn complete(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        variables: &Variables,
    ) -> Result<(), LatchError> {
        let body = json!({
            "workerId": worker_id.as_str(),
            "variables": variables.to_wire(),
        });
        self.post_task_action(task_id, "complete", body).await
    }

    async fn report_business_error(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        error: &BusinessError,
    ) -> Result<(), LatchError> {
        let body = json!({
            "workerId": worker_id.as_str(),
            "errorCode": error.code,
            "errorMessage": error.message,
            "variables": error.variables.to_wire(),
        });
        self.post_task_action(task_id, "bpmnError", body).await
    }

    async fn report_failure(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        failure: &Failure,
    ) -> Result<(), LatchError> {
        let body = json!({
            "workerId": worker_id.as_str(),
            "errorMessage": failure.message,
            "errorDetails": failure.details,
            "retries": failure.retries,
            "retryTimeout": millis(failure.retry_timeout),
        });
        self.post_task_action(task_id, "failure", body).await
    }

    async fn extend_lock(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        new_duration: Duration,
    ) -> Result<(), LatchError> {
        let body = json!({
            "workerId": worker_id.as_str(),
            "newDuration": millis(new_duration),
        });
        self.post_task_action(task_id, "extendLock", body).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(base_url = %self.config.base_url, "engine gateway closed");
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Parse an engine timestamp; accepts RFC 3339 as well.
pub fn parse_engine_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, ENGINE_TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
