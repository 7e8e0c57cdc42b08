#![allow(dead_code)] // Each test binary uses a different subset

pub mod recording;

use b2_storage_client::{B2Client, B2ClientBuilder, ClientIdentity, RetryPolicy};
use httpmock::Method::GET;
use httpmock::{Mock, MockServer};
use serde_json::json;
use std::net::TcpListener;
use std::time::Duration;

pub const KEY_ID: &str = "key-id";
pub const APP_KEY: &str = "app-key";
/// base64("key-id:app-key")
pub const BASIC_AUTH: &str = "Basic a2V5LWlkOmFwcC1rZXk=";
pub const ACCOUNT_TOKEN: &str = "acct-token";
pub const PART_TOKEN: &str = "part-token";
pub const MIB: usize = 1024 * 1024;

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Mock `b2_authorize_account`, pointing the API back at the same server
pub async fn mock_authorize(server: &MockServer, recommended_part_size: usize) -> Mock<'_> {
    let body = json!({
        "accountId": "acct-1",
        "apiUrl": server.base_url(),
        "downloadUrl": server.url("/download"),
        "authorizationToken": ACCOUNT_TOKEN,
        "recommendedPartSize": recommended_part_size,
        "absoluteMinimumPartSize": 5 * MIB,
    });

    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/b2api/v2/b2_authorize_account")
                .header("authorization", BASIC_AUTH);
            then.status(200).json_body(body);
        })
        .await
}

/// Builder wired to the mock server with a short fixed retry delay
pub fn builder(server: &MockServer) -> B2ClientBuilder {
    builder_for(server.url("/b2api/v2"))
}

pub fn builder_for(auth_url: impl Into<String>) -> B2ClientBuilder {
    B2Client::builder(ClientIdentity::new(KEY_ID, APP_KEY))
        .auth_url(auth_url)
        .retry(RetryPolicy::new(3, Duration::from_millis(10)))
}

pub fn client(server: &MockServer) -> B2Client {
    builder(server).build().expect("client builds")
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
