//! B2 Storage Client
//!
//! Resilient client for the Backblaze B2 native API. Wraps account
//! authorization, fixed-interval retries and the named API operations behind
//! one [`B2Client`], and adds a large file uploader that splits a payload into
//! parts and drives the start / upload part / finish sequence.
//!
//! ## Features
//!
//! - **Session caching**: one authorization per credential pair, reused until
//!   shortly before the service expires it
//! - **Fixed-delay retries**: every named operation and every part upload is
//!   retried as a unit
//! - **Named operations**: the B2 operation catalog with JSON pass-through
//!   parameters and responses
//! - **Large files**: part sizing from the service recommendation with a 5MB
//!   floor, sequential part uploads by default
//!
//! ## Architecture
//!
//! ```text
//!  LargeFileUploader
//!        │ start / part url / finish        part bytes
//!        ▼                                       │
//! ┌──────────────┐   retry as a unit   ┌─────────┴────┐
//! │ B2Client     │────────────────────▶│ RetryPolicy  │
//! │ (invoke)     │                     └──────────────┘
//! └──────────────┘
//!        │ ensure_session
//!        ▼
//! ┌──────────────┐   b2_authorize_account
//! │ Session      │─────────────────────────▶ B2
//! │ Manager      │
//! └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod upload;

pub use api::{B2Client, B2ClientBuilder, HttpMethod, NamedOperation, UploadPartUrl, UploadUrl};
pub use config::Config;
pub use error::{B2Error, FailureKind, Result};
pub use retry::RetryPolicy;
pub use session::{AuthSession, ClientIdentity, SessionManager, SessionSettings};
pub use upload::{ChecksumMode, LargeFileUploader, UploadOptions, UploadPlan, MIN_PART_SIZE};
