//! B2 native API invoker.
//!
//! [`B2Client`] turns named operations into authorized HTTP calls. Each call
//! is retried as a unit with the client's [`RetryPolicy`], and every attempt
//! makes sure a valid session exists before dispatching.

use crate::config::Config;
use crate::error::{read_bytes, read_json, B2Error, Result};
use crate::retry::RetryPolicy;
use crate::session::{ClientIdentity, SessionManager, SessionSettings};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying the 1-based part number on part uploads
pub const PART_NUMBER_HEADER: &str = "X-Bz-Part-Number";
/// Header carrying the SHA-1 of the uploaded bytes
pub const CONTENT_SHA1_HEADER: &str = "X-Bz-Content-Sha1";
/// Header carrying the percent-encoded file name on single-file uploads
pub const FILE_NAME_HEADER: &str = "X-Bz-File-Name";

/// HTTP method of a named operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One call to a named B2 API operation
#[derive(Debug, Clone)]
pub struct NamedOperation {
    /// Operation name, e.g. `b2_list_buckets`
    pub endpoint: &'static str,
    pub method: HttpMethod,
    /// JSON body for POST operations
    pub body: Value,
    /// Query parameters; must be a flat JSON object or null
    pub query: Value,
}

impl NamedOperation {
    /// POST operation with a JSON body
    pub fn post(endpoint: &'static str, body: Value) -> Self {
        Self {
            endpoint,
            method: HttpMethod::Post,
            body,
            query: Value::Null,
        }
    }

    /// GET operation with query parameters
    pub fn get(endpoint: &'static str, query: Value) -> Self {
        Self {
            endpoint,
            method: HttpMethod::Get,
            body: Value::Null,
            query,
        }
    }

    fn has_query(&self) -> bool {
        matches!(&self.query, Value::Object(map) if !map.is_empty())
    }
}

/// `b2_start_large_file` response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLargeFileResponse {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    /// Not part of the documented response; honoured when present
    #[serde(default)]
    pub recommended_part_size: Option<u64>,
}

/// `b2_get_upload_part_url` response: a one-time upload target for parts
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartUrl {
    pub file_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

/// `b2_get_upload_url` response: a target for single-request uploads
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrl {
    pub bucket_id: String,
    pub upload_url: String,
    pub authorization_token: String,
}

/// Client for the B2 native API.
///
/// Cheap to clone; clones share the HTTP connection pool and the session.
#[derive(Clone)]
pub struct B2Client {
    http: reqwest::Client,
    session: Arc<SessionManager>,
    retry: RetryPolicy,
    classify_errors: bool,
}

/// Builder for [`B2Client`]
pub struct B2ClientBuilder {
    identity: ClientIdentity,
    session: SessionSettings,
    retry: RetryPolicy,
    classify_errors: bool,
    request_timeout: Option<Duration>,
}

impl B2ClientBuilder {
    pub fn new(identity: ClientIdentity) -> Self {
        Self {
            identity,
            session: SessionSettings::default(),
            retry: RetryPolicy::default(),
            classify_errors: false,
            request_timeout: None,
        }
    }

    /// Override the account authorization endpoint base
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.session.auth_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session.ttl = ttl;
        self
    }

    pub fn safety_margin(mut self, margin: Duration) -> Self {
        self.session.safety_margin = margin;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Only retry errors classified as transient or rate limited
    pub fn classify_errors(mut self, enabled: bool) -> Self {
        self.classify_errors = enabled;
        self
    }

    /// Per-request timeout; unset leaves the transport default
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<B2Client> {
        let mut http = reqwest::Client::builder();
        if let Some(timeout) = self.request_timeout {
            http = http.timeout(timeout);
        }
        let http = http.build()?;

        let session = SessionManager::new(http.clone(), self.identity, self.session);

        Ok(B2Client {
            http,
            session: Arc::new(session),
            retry: self.retry,
            classify_errors: self.classify_errors,
        })
    }
}

impl B2Client {
    pub fn builder(identity: ClientIdentity) -> B2ClientBuilder {
        B2ClientBuilder::new(identity)
    }

    /// Build a client from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = Self::builder(ClientIdentity::new(
            config.b2.key_id.clone(),
            config.b2.application_key.clone(),
        ))
        .auth_url(config.b2.auth_url.clone())
        .session_ttl(config.session_ttl())
        .safety_margin(config.session_safety_margin())
        .retry(config.retry_policy())
        .classify_errors(config.retry.classify_errors);

        if let Some(timeout) = config.request_timeout() {
            builder = builder.request_timeout(timeout);
        }

        builder.build()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run `operation` under the client's retry policy
    pub(crate) async fn with_retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.classify_errors {
            self.retry
                .execute_when(operation, B2Error::is_retryable)
                .await
        } else {
            self.retry.execute(operation).await
        }
    }

    /// Invoke a named operation and return the response body verbatim
    #[instrument(skip(self, operation), fields(endpoint = operation.endpoint))]
    pub async fn invoke(&self, operation: NamedOperation) -> Result<Value> {
        let op = &operation;
        self.counted(op.endpoint, self.with_retry(|| self.dispatch(op)))
            .await
    }

    /// Invoke a named operation and decode the response
    pub async fn invoke_as<T: DeserializeOwned>(&self, operation: NamedOperation) -> Result<T> {
        let value = self.invoke(operation).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke a named operation whose success body is not JSON (downloads)
    /// and return the bytes untouched
    #[instrument(skip(self, operation), fields(endpoint = operation.endpoint))]
    pub async fn invoke_raw(&self, operation: NamedOperation) -> Result<Bytes> {
        let op = &operation;
        self.counted(op.endpoint, self.with_retry(|| self.dispatch_raw(op)))
            .await
    }

    async fn counted<T>(
        &self,
        endpoint: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        metrics::counter!("b2.api.calls", "endpoint" => endpoint).increment(1);

        let result = call.await;
        if result.is_err() {
            metrics::counter!("b2.api.failures", "endpoint" => endpoint).increment(1);
        }
        result
    }

    /// One attempt: ensure a session, then send the request
    async fn send(&self, op: &NamedOperation) -> Result<reqwest::Response> {
        let session = self.session.ensure_session().await?;
        let url = format!("{}/{}", session.api_url, op.endpoint);

        let mut request = match op.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url).json(&op.body),
        };
        if op.has_query() {
            request = request.query(&op.query);
        }

        debug!(url = %url, "Dispatching B2 request");

        Ok(request
            .header(AUTHORIZATION, &session.authorization_token)
            .send()
            .await?)
    }

    async fn dispatch(&self, op: &NamedOperation) -> Result<Value> {
        let response = self.send(op).await?;
        self.drop_session_on_expiry(read_json(response).await).await
    }

    async fn dispatch_raw(&self, op: &NamedOperation) -> Result<Bytes> {
        let response = self.send(op).await?;
        self.drop_session_on_expiry(read_bytes(response).await).await
    }

    async fn drop_session_on_expiry<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_expired_token() {
                // Next attempt re-authorizes instead of reusing the stale token
                self.session.invalidate().await;
            }
        }
        result
    }

    /// POST raw bytes to an upload URL obtained from the service
    pub(crate) async fn send_upload(
        &self,
        upload_url: &str,
        upload_token: &str,
        body: Bytes,
        headers: &[(&'static str, String)],
    ) -> Result<Value> {
        let mut request = self
            .http
            .post(upload_url)
            .header(AUTHORIZATION, upload_token)
            .header(CONTENT_LENGTH, body.len().to_string());
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.body(body).send().await?;
        read_json(response).await
    }

    /// Upload one part of a large file to its part URL (single attempt)
    pub(crate) async fn upload_part_bytes(
        &self,
        target: &UploadPartUrl,
        part_number: u32,
        bytes: Bytes,
        sha1: &str,
    ) -> Result<Value> {
        let headers = [
            (PART_NUMBER_HEADER, part_number.to_string()),
            (CONTENT_SHA1_HEADER, sha1.to_string()),
        ];
        self.send_upload(&target.upload_url, &target.authorization_token, bytes, &headers)
            .await
    }

    // Typed helpers

    /// Start a large file and return its id
    pub async fn start_large_file(
        &self,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
    ) -> Result<StartLargeFileResponse> {
        self.invoke_as(NamedOperation::post(
            "b2_start_large_file",
            json!({
                "bucketId": bucket_id,
                "fileName": file_name,
                "contentType": content_type,
            }),
        ))
        .await
    }

    /// Get a one-time upload URL and token for parts of `file_id`
    pub async fn get_upload_part_url(&self, file_id: &str) -> Result<UploadPartUrl> {
        self.invoke_as(NamedOperation::post(
            "b2_get_upload_part_url",
            json!({ "fileId": file_id }),
        ))
        .await
    }

    /// Get an upload URL and short-lived token for single-request uploads
    pub async fn get_upload_url(&self, bucket_id: &str) -> Result<UploadUrl> {
        let value = self.b2_get_upload_url(bucket_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Upload a small file in one request.
    ///
    /// The upload URL is fetched once; only the upload POST is retried.
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn upload_file(
        &self,
        bucket_id: &str,
        file_name: &str,
        content_type: &str,
        bytes: Bytes,
        sha1: &str,
    ) -> Result<Value> {
        let target = self.get_upload_url(bucket_id).await?;
        let headers = [
            (FILE_NAME_HEADER, encode_file_name(file_name)),
            ("Content-Type", content_type.to_string()),
            (CONTENT_SHA1_HEADER, sha1.to_string()),
        ];

        let target = &target;
        let headers = &headers;
        self.with_retry(|| {
            self.send_upload(
                &target.upload_url,
                &target.authorization_token,
                bytes.clone(),
                headers,
            )
        })
        .await
    }

    // Named operation catalog. Parameters and responses are passed through
    // in the service's own JSON shape.

    /// Force a fresh account authorization and return the session view of
    /// it. `apiUrl` is the versioned base named operations are sent to, and
    /// the authorization token is left out.
    pub async fn b2_authorize_account(&self) -> Result<Value> {
        let session = self.session.authorize().await?;
        Ok(json!({
            "accountId": session.account_id,
            "apiUrl": session.api_url,
            "downloadUrl": session.download_url,
            "recommendedPartSize": session.recommended_part_size,
            "absoluteMinimumPartSize": session.absolute_minimum_part_size,
        }))
    }

    pub async fn b2_cancel_large_file(&self, file_id: &str) -> Result<Value> {
        self.invoke(NamedOperation::post(
            "b2_cancel_large_file",
            json!({ "fileId": file_id }),
        ))
        .await
    }

    pub async fn b2_copy_file(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_copy_file", params)).await
    }

    pub async fn b2_copy_part(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_copy_part", params)).await
    }

    pub async fn b2_create_bucket(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_create_bucket", params)).await
    }

    pub async fn b2_create_key(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_create_key", params)).await
    }

    pub async fn b2_delete_bucket(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_delete_bucket", params)).await
    }

    pub async fn b2_delete_file_version(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_delete_file_version", params))
            .await
    }

    pub async fn b2_delete_key(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_delete_key", params)).await
    }

    /// Returns the file content as sent by the service
    pub async fn b2_download_file_by_id(&self, params: Value) -> Result<Bytes> {
        self.invoke_raw(NamedOperation::get("b2_download_file_by_id", params))
            .await
    }

    /// Returns the file content as sent by the service
    pub async fn b2_download_file_by_name(&self, params: Value) -> Result<Bytes> {
        self.invoke_raw(NamedOperation::get("b2_download_file_by_name", params))
            .await
    }

    pub async fn b2_finish_large_file(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_finish_large_file", params))
            .await
    }

    pub async fn b2_get_download_authorization(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post(
            "b2_get_download_authorization",
            params,
        ))
        .await
    }

    pub async fn b2_get_file_info(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_get_file_info", params)).await
    }

    pub async fn b2_get_upload_part_url(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_get_upload_part_url", params))
            .await
    }

    pub async fn b2_get_upload_url(&self, bucket_id: &str) -> Result<Value> {
        self.invoke(NamedOperation::get(
            "b2_get_upload_url",
            json!({ "bucketId": bucket_id }),
        ))
        .await
    }

    pub async fn b2_hide_file(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_hide_file", params)).await
    }

    pub async fn b2_list_buckets(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_list_buckets", params)).await
    }

    pub async fn b2_list_file_names(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_list_file_names", params))
            .await
    }

    pub async fn b2_list_file_versions(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_list_file_versions", params))
            .await
    }

    pub async fn b2_list_keys(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_list_keys", params)).await
    }

    pub async fn b2_list_parts(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_list_parts", params)).await
    }

    pub async fn b2_list_unfinished_large_files(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post(
            "b2_list_unfinished_large_files",
            params,
        ))
        .await
    }

    pub async fn b2_start_large_file(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_start_large_file", params))
            .await
    }

    pub async fn b2_update_bucket(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_update_bucket", params)).await
    }

    pub async fn b2_update_file_legal_hold(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_update_file_legal_hold", params))
            .await
    }

    pub async fn b2_update_file_retention(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_update_file_retention", params))
            .await
    }

    pub async fn b2_upload_file(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_upload_file", params)).await
    }

    pub async fn b2_upload_part(&self, params: Value) -> Result<Value> {
        self.invoke(NamedOperation::post("b2_upload_part", params)).await
    }
}

/// Characters left literal in `X-Bz-File-Name`; everything else is `%XX`
/// encoded as UTF-8.
const FILE_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn encode_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_SET).to_string()
}
