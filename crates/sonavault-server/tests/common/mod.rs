//! Shared integration test harness.
//!
//! Spins the full application on an ephemeral port and talks to it over
//! real HTTP, so range semantics, headers, and status codes are exercised
//! end to end.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use sonavault_core::Config;
use sonavault_core::store::MemoryStore;
use sonavault_server::{AppState, build_router};

pub struct TestServer {
    pub base: String,
    pub client: reqwest::Client,
    chapter_root: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

/// A logged-in identity for request helpers.
#[derive(Clone)]
pub struct Account {
    pub bearer: String,
    pub device_id: String,
    pub user_id: String,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Config::for_testing(tmp.path());
        let chapter_root = config.chapter_storage_root.clone();
        let state = AppState::new(&config, Arc::new(MemoryStore::new()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, build_router(state))
                .await
                .expect("server task");
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            chapter_root,
            _tmp: tmp,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Where finalized chapter ciphertext lands (for tamper tests).
    pub fn chapter_storage_root(&self) -> &std::path::Path {
        &self.chapter_root
    }

    /// Register a user and log in from the given device.
    ///
    /// The first account registered on a server is the admin.
    pub async fn register(&self, email: &str, device_id: &str) -> Account {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(&json!({
                "email": email,
                "password": "correct horse",
                "deviceData": device_payload(device_id),
            }))
            .send()
            .await
            .expect("register request");
        assert_eq!(response.status(), StatusCode::OK, "register failed");
        let body: Value = response.json().await.expect("register body");

        Account {
            bearer: body["token"].as_str().expect("token").to_string(),
            device_id: device_id.to_string(),
            user_id: body["user"]["id"].as_str().expect("user id").to_string(),
        }
    }

    pub async fn login(&self, email: &str, device_id: &str) -> Value {
        self.client
            .post(self.url("/auth/login"))
            .json(&json!({
                "email": email,
                "password": "correct horse",
                "deviceData": device_payload(device_id),
            }))
            .send()
            .await
            .expect("login request")
            .json()
            .await
            .expect("login body")
    }

    pub fn authed(&self, method: reqwest::Method, path: &str, account: &Account) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&account.bearer)
            .header("x-device-id", &account.device_id)
    }

    pub async fn get_json(&self, path: &str, account: &Account) -> Value {
        let response = self
            .authed(reqwest::Method::GET, path, account)
            .send()
            .await
            .expect("get request");
        assert!(
            response.status().is_success(),
            "GET {path} failed: {}",
            response.status()
        );
        response.json().await.expect("json body")
    }

    pub async fn post_json(&self, path: &str, account: &Account, body: Value) -> reqwest::Response {
        self.authed(reqwest::Method::POST, path, account)
            .json(&body)
            .send()
            .await
            .expect("post request")
    }

    /// Upload a file through the chunked pipeline and return its id.
    pub async fn upload_file(
        &self,
        account: &Account,
        content: &[u8],
        chunk_size: usize,
        duration_seconds: f64,
    ) -> String {
        let chunks: Vec<&[u8]> = content.chunks(chunk_size).collect();

        let init: Value = self
            .post_json(
                "/audio/upload/init",
                account,
                json!({
                    "fileName": "test.mp3",
                    "fileSize": content.len(),
                    "totalChunks": chunks.len(),
                    "fileHash": sha256_hex(content),
                    "mimeType": "audio/mpeg",
                }),
            )
            .await
            .json()
            .await
            .expect("init body");
        let upload_id = init["data"]["uploadId"].as_str().expect("uploadId").to_string();

        for (index, chunk) in chunks.iter().enumerate() {
            let response = self.put_chunk(account, &upload_id, index, chunk).await;
            assert_eq!(response.status(), StatusCode::OK, "chunk {index} failed");
        }

        let form = reqwest::multipart::Form::new()
            .text("durationSeconds", duration_seconds.to_string())
            .text("title", "Uploaded fixture");
        let response = self
            .authed(
                reqwest::Method::POST,
                &format!("/audio/upload/finalize/{upload_id}"),
                account,
            )
            .multipart(form)
            .send()
            .await
            .expect("finalize request");
        assert_eq!(response.status(), StatusCode::OK, "finalize failed");
        let body: Value = response.json().await.expect("finalize body");
        body["data"]["id"].as_str().expect("file id").to_string()
    }

    pub async fn put_chunk(
        &self,
        account: &Account,
        upload_id: &str,
        index: usize,
        bytes: &[u8],
    ) -> reqwest::Response {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("chunk.bin");
        let form = reqwest::multipart::Form::new().part("chunk", part);
        self.authed(reqwest::Method::POST, "/audio/upload/chunk", account)
            .header("x-upload-id", upload_id)
            .header("x-chunk-index", index.to_string())
            .multipart(form)
            .send()
            .await
            .expect("chunk request")
    }

    /// Define and finalize the canonical three-chapter split.
    pub async fn chapterize(&self, admin: &Account, file_id: &str, duration: f64) {
        let third = duration / 3.0;
        let response = self
            .post_json(
                &format!("/files/{file_id}/chapters"),
                admin,
                json!({ "chapters": [
                    { "label": "Intro", "startTime": 0.0, "endTime": third },
                    { "label": "Body", "startTime": third, "endTime": third * 2.0 },
                    { "label": "Outro", "startTime": third * 2.0, "endTime": null },
                ]}),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "chapter upsert failed");

        let response = self
            .post_json(
                &format!("/files/{file_id}/chapters/finalize"),
                admin,
                json!({ "storageType": "filesystem" }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "finalize failed");
        let body: Value = response.json().await.expect("finalize body");
        assert_eq!(body["summary"]["failed"], 0, "chapters failed: {body}");
    }
}

pub fn device_payload(device_id: &str) -> Value {
    json!({
        "deviceId": device_id,
        "deviceFingerprint": format!("fp-{device_id}"),
        "deviceName": format!("Device {device_id}"),
        "platform": "test",
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic pseudo-random content for byte-exact assertions.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}
