//! Large file upload orchestration.
//!
//! A large file goes through `b2_start_large_file`, one
//! `b2_get_upload_part_url` + part POST per part, and `b2_finish_large_file`.
//! Parts are uploaded one at a time in part-number order unless part
//! concurrency is raised explicitly. A part that exhausts its retries aborts
//! the whole upload; the finish call is never made after a failure.

use crate::api::{B2Client, UploadPartUrl};
use crate::config::UploadConfig;
use crate::error::{B2Error, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::future::Future;
use std::ops::Range;
use tracing::{debug, error, info, instrument, warn};

/// Smallest part size the service accepts (5MB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Sentinel sent in place of a part checksum when verification is skipped
pub const DO_NOT_VERIFY: &str = "do_not_verify";

/// How part checksums are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Send the `do_not_verify` sentinel
    #[default]
    DoNotVerify,
    /// Compute SHA-1 per part and send `partSha1Array` on finish
    Sha1,
}

impl ChecksumMode {
    /// Value for the `X-Bz-Content-Sha1` header of `bytes`
    pub fn header_value(&self, bytes: &[u8]) -> String {
        match self {
            ChecksumMode::DoNotVerify => DO_NOT_VERIFY.to_string(),
            ChecksumMode::Sha1 => sha1_hex(bytes),
        }
    }
}

/// Hex-encoded SHA-1 of `bytes`
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Options for large file uploads
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub min_part_size: u64,
    pub part_concurrency: usize,
    pub checksum: ChecksumMode,
    pub cancel_on_failure: bool,
    pub content_type: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadConfig::default().into()
    }
}

impl From<UploadConfig> for UploadOptions {
    fn from(config: UploadConfig) -> Self {
        Self {
            min_part_size: config.min_part_size_bytes.max(MIN_PART_SIZE),
            part_concurrency: config.part_concurrency.max(1),
            checksum: config.checksum,
            cancel_on_failure: config.cancel_on_failure,
            content_type: config.content_type,
        }
    }
}

/// Part layout of one large file upload, fixed once the file is started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    pub file_id: String,
    pub part_size: u64,
    pub total_parts: u32,
    pub content_length: u64,
}

impl UploadPlan {
    /// `part_size = max(recommended, min_part_size)`,
    /// `total_parts = ceil(content_length / part_size)`
    pub fn new(
        file_id: impl Into<String>,
        content_length: u64,
        recommended_part_size: Option<u64>,
        min_part_size: u64,
    ) -> Self {
        let part_size = recommended_part_size.unwrap_or(0).max(min_part_size).max(1);
        let total_parts = content_length.div_ceil(part_size) as u32;

        Self {
            file_id: file_id.into(),
            part_size,
            total_parts,
            content_length,
        }
    }

    /// Byte range of a 1-based part, clamped to the content length
    pub fn part_range(&self, part_number: u32) -> Range<usize> {
        let start = (part_number as u64 - 1) * self.part_size;
        let end = (part_number as u64 * self.part_size).min(self.content_length);
        start as usize..end as usize
    }

    pub fn part_len(&self, part_number: u32) -> u64 {
        let range = self.part_range(part_number);
        (range.end - range.start) as u64
    }
}

/// Lifecycle of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NotStarted,
    Started,
    UploadingPart(u32),
    Finishing,
    Completed,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (*self, next) {
            (s, Failed) => !s.is_terminal(),
            (NotStarted, Started) => true,
            (Started, UploadingPart(1)) => true,
            (UploadingPart(n), UploadingPart(m)) => m == n + 1,
            (Started, Finishing) | (UploadingPart(_), Finishing) => true,
            (Finishing, Completed) => true,
            _ => false,
        }
    }
}

/// Outcome of one uploaded part
#[derive(Debug, Clone)]
pub struct PartReceipt {
    pub part_number: u32,
    pub content_length: u64,
    /// Checksum header value sent with the part
    pub sha1: String,
}

/// Drive `upload_part` over parts `1..=total_parts`.
///
/// `on_start` sees every part number, in increasing order, right before its
/// upload is created. With `concurrency == 1` each part completes before the
/// next starts. Higher values keep up to `concurrency` parts in flight. The
/// first error stops the run and no further part is started. Receipts are
/// returned sorted by part number.
pub async fn drive_parts<S, F, Fut>(
    total_parts: u32,
    concurrency: usize,
    mut on_start: S,
    upload_part: F,
) -> Result<Vec<PartReceipt>>
where
    S: FnMut(u32),
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<PartReceipt>>,
{
    if concurrency <= 1 {
        let mut receipts = Vec::with_capacity(total_parts as usize);
        for part_number in 1..=total_parts {
            on_start(part_number);
            receipts.push(upload_part(part_number).await?);
        }
        return Ok(receipts);
    }

    let mut receipts: Vec<PartReceipt> = stream::iter(1..=total_parts)
        .map(|part_number| {
            on_start(part_number);
            upload_part(part_number)
        })
        .buffer_unordered(concurrency)
        .try_collect()
        .await?;
    receipts.sort_by_key(|r| r.part_number);
    Ok(receipts)
}

/// Uploads files too large for a single request
pub struct LargeFileUploader {
    client: B2Client,
    options: UploadOptions,
}

impl LargeFileUploader {
    pub fn new(client: B2Client, options: UploadOptions) -> Self {
        Self { client, options }
    }

    /// Upload `data` as `file_name` into `bucket_id` and return the
    /// `b2_finish_large_file` response unchanged.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn upload_large_file(
        &self,
        data: Bytes,
        file_name: &str,
        bucket_id: &str,
    ) -> Result<Value> {
        if data.is_empty() {
            return Err(B2Error::invalid("large file upload requires at least one byte"));
        }

        let mut state = UploadState::NotStarted;

        let started = self
            .client
            .start_large_file(bucket_id, file_name, &self.options.content_type)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to start large file");
                e
            })?;
        advance(&mut state, UploadState::Started);

        let recommended = match started.recommended_part_size {
            Some(size) => Some(size),
            None => self
                .client
                .session()
                .current()
                .await
                .and_then(|s| s.recommended_part_size),
        };
        let plan = UploadPlan::new(
            started.file_id,
            data.len() as u64,
            recommended,
            self.options.min_part_size,
        );

        info!(
            file_id = %plan.file_id,
            part_size = plan.part_size,
            total_parts = plan.total_parts,
            "Large file started"
        );

        match self.upload_parts_and_finish(&plan, &data, &mut state).await {
            Ok(response) => {
                advance(&mut state, UploadState::Completed);
                metrics::counter!("b2.large_files.completed").increment(1);
                info!(file_id = %plan.file_id, "Large file completed");
                Ok(response)
            }
            Err(e) => {
                advance(&mut state, UploadState::Failed);
                metrics::counter!("b2.large_files.failed").increment(1);
                error!(file_id = %plan.file_id, error = %e, "Large file upload failed");

                if self.options.cancel_on_failure {
                    self.cancel_quietly(&plan.file_id).await;
                }
                Err(e)
            }
        }
    }

    async fn upload_parts_and_finish(
        &self,
        plan: &UploadPlan,
        data: &Bytes,
        state: &mut UploadState,
    ) -> Result<Value> {
        let receipts = drive_parts(
            plan.total_parts,
            self.options.part_concurrency,
            |n| advance(state, UploadState::UploadingPart(n)),
            |n| self.upload_part(plan, data, n),
        )
        .await?;

        advance(state, UploadState::Finishing);

        let mut body = json!({ "fileId": plan.file_id });
        if self.options.checksum == ChecksumMode::Sha1 {
            let hashes: Vec<&str> = receipts.iter().map(|r| r.sha1.as_str()).collect();
            body["partSha1Array"] = json!(hashes);
        }

        self.client.b2_finish_large_file(body).await
    }

    /// Fetch a part URL and upload one part, retrying only the upload POST
    async fn upload_part(&self, plan: &UploadPlan, data: &Bytes, part_number: u32) -> Result<PartReceipt> {
        let chunk = data.slice(plan.part_range(part_number));
        let sha1 = self.options.checksum.header_value(&chunk);

        let target: UploadPartUrl = self.client.get_upload_part_url(&plan.file_id).await?;

        debug!(
            file_id = %plan.file_id,
            part_number = part_number,
            size_bytes = chunk.len(),
            "Uploading part"
        );

        let target = &target;
        let sha1_ref = sha1.as_str();
        self.client
            .with_retry(|| {
                self.client
                    .upload_part_bytes(target, part_number, chunk.clone(), sha1_ref)
            })
            .await?;

        let content_length = plan.part_len(part_number);
        metrics::counter!("b2.parts.uploaded").increment(1);
        metrics::counter!("b2.bytes.uploaded").increment(content_length);

        Ok(PartReceipt {
            part_number,
            content_length,
            sha1,
        })
    }

    async fn cancel_quietly(&self, file_id: &str) {
        match self.client.b2_cancel_large_file(file_id).await {
            Ok(_) => info!(file_id = %file_id, "Cancelled unfinished large file"),
            Err(e) => warn!(
                file_id = %file_id,
                error = %e,
                "Failed to cancel unfinished large file"
            ),
        }
    }
}

fn advance(state: &mut UploadState, next: UploadState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal upload transition {:?} -> {:?}",
        state,
        next
    );
    debug!(from = ?state, to = ?next, "Upload state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_twelve_mib_with_five_mib_parts() {
        let plan = UploadPlan::new("f1", 12 * MIB, Some(5 * MIB), MIN_PART_SIZE);
        assert_eq!(plan.part_size, 5 * MIB);
        assert_eq!(plan.total_parts, 3);
        assert_eq!(plan.part_len(1), 5 * MIB);
        assert_eq!(plan.part_len(2), 5 * MIB);
        assert_eq!(plan.part_len(3), 2 * MIB);
        assert_eq!(plan.part_range(3), (10 * MIB) as usize..(12 * MIB) as usize);
    }

    #[test]
    fn test_plan_floors_small_recommendation() {
        let plan = UploadPlan::new("f1", 11 * MIB, Some(MIB), MIN_PART_SIZE);
        assert_eq!(plan.part_size, MIN_PART_SIZE);
        assert_eq!(plan.total_parts, 3);
    }

    #[test]
    fn test_plan_uses_larger_recommendation() {
        let plan = UploadPlan::new("f1", 250 * MIB, Some(100 * MIB), MIN_PART_SIZE);
        assert_eq!(plan.part_size, 100 * MIB);
        assert_eq!(plan.total_parts, 3);
        assert_eq!(plan.part_len(3), 50 * MIB);
    }

    #[test]
    fn test_plan_without_recommendation() {
        let plan = UploadPlan::new("f1", MIB, None, MIN_PART_SIZE);
        assert_eq!(plan.part_size, MIN_PART_SIZE);
        assert_eq!(plan.total_parts, 1);
        assert_eq!(plan.part_len(1), MIB);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let plan = UploadPlan::new("f1", 10 * MIB, Some(5 * MIB), MIN_PART_SIZE);
        assert_eq!(plan.total_parts, 2);
        assert_eq!(plan.part_len(2), 5 * MIB);
    }

    #[test]
    fn test_state_transitions() {
        use UploadState::*;
        assert!(NotStarted.can_transition_to(Started));
        assert!(Started.can_transition_to(UploadingPart(1)));
        assert!(UploadingPart(1).can_transition_to(UploadingPart(2)));
        assert!(!UploadingPart(1).can_transition_to(UploadingPart(3)));
        assert!(UploadingPart(3).can_transition_to(Finishing));
        assert!(Finishing.can_transition_to(Completed));
        assert!(UploadingPart(2).can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!NotStarted.can_transition_to(Finishing));
    }

    #[test]
    fn test_checksum_header_values() {
        assert_eq!(ChecksumMode::DoNotVerify.header_value(b"abc"), DO_NOT_VERIFY);
        assert_eq!(
            ChecksumMode::Sha1.header_value(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_options_from_config_clamp() {
        let options: UploadOptions = UploadConfig {
            min_part_size_bytes: 1,
            part_concurrency: 0,
            ..Default::default()
        }
        .into();
        assert_eq!(options.min_part_size, MIN_PART_SIZE);
        assert_eq!(options.part_concurrency, 1);
    }

    fn receipt(part_number: u32) -> PartReceipt {
        PartReceipt {
            part_number,
            content_length: 1,
            sha1: DO_NOT_VERIFY.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_parts_in_order_without_overlap() {
        let order = &Mutex::new(Vec::new());
        let in_flight = &AtomicUsize::new(0);
        let max_in_flight = &AtomicUsize::new(0);

        let mut starts = Vec::new();

        let receipts = drive_parts(5, 1, |n| starts.push(n), |n| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(now, Ordering::SeqCst);
            order.lock().unwrap().push(n);
            tokio::time::sleep(Duration::from_millis(10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(receipt(n))
        })
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(starts, vec![1, 2, 3, 4, 5]);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(receipts.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_failure_stops_later_parts() {
        let started = &Mutex::new(Vec::new());

        let result = drive_parts(5, 1, |_| {}, |n| async move {
            started.lock().unwrap().push(n);
            if n == 2 {
                Err(B2Error::api(500, "part failed"))
            } else {
                Ok(receipt(n))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(*started.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_parts_bounded_and_sorted() {
        let in_flight = &AtomicUsize::new(0);
        let max_in_flight = &AtomicUsize::new(0);

        let mut starts = Vec::new();

        let receipts = drive_parts(8, 3, |n| starts.push(n), |n| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(now, Ordering::SeqCst);
            // Later parts finish first
            tokio::time::sleep(Duration::from_millis(100 - n as u64 * 10)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(receipt(n))
        })
        .await
        .unwrap();

        assert!(max_in_flight.load(Ordering::SeqCst) <= 3);
        // Parts are started in order even when they finish out of order
        assert_eq!(starts, (1..=8).collect::<Vec<_>>());
        let numbers: Vec<u32> = receipts.iter().map(|r| r.part_number).collect();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
    }
}
