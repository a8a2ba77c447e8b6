//! Range streaming integration tests: DRM sessions, signed URLs, chapter
//! streams, and failure semantics over real HTTP.

mod common;

use common::{TestServer, patterned_bytes};
use reqwest::StatusCode;
use serde_json::{Value, json};

const CONTENT_LEN: usize = 300_000;
const DURATION: f64 = 120.0;

/// Upload, chapterize into thirds, and return (file id, content).
async fn chaptered_fixture(server: &TestServer, admin: &common::Account) -> (String, Vec<u8>) {
    let content = patterned_bytes(CONTENT_LEN);
    let file_id = server.upload_file(admin, &content, 100_000, DURATION).await;
    server.chapterize(admin, &file_id, DURATION).await;
    (file_id, content)
}

async fn session_token(server: &TestServer, account: &common::Account, file_id: &str) -> String {
    let body: Value = server
        .post_json(&format!("/drm/session/{file_id}"), account, json!({}))
        .await
        .json()
        .await
        .unwrap();
    body["sessionToken"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn full_file_stream_over_chapters_matches_original() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, content) = chaptered_fixture(&server, &admin).await;

    let token = session_token(&server, &admin, &file_id).await;
    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("accept-ranges").unwrap(),
        "bytes"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-store, private"
    );
    assert_eq!(
        response.headers().get("content-disposition").unwrap(),
        "inline"
    );
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "audio/mpeg"
    );

    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), content.len());
    assert_eq!(&bytes[..], &content[..]);
}

#[tokio::test]
async fn range_request_is_byte_exact_across_chapters() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, content) = chaptered_fixture(&server, &admin).await;
    let token = session_token(&server, &admin, &file_id).await;

    // A range spanning the first/second chapter boundary (100_000).
    let (start, end) = (95_000usize, 105_999usize);
    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .header("range", format!("bytes={start}-{end}"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        &format!("bytes {start}-{end}/{CONTENT_LEN}")
    );
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), end - start + 1);
    assert_eq!(&bytes[..], &content[start..=end]);
}

#[tokio::test]
async fn chapter_stream_url_serves_only_that_chapter() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, content) = chaptered_fixture(&server, &admin).await;

    // The "Body" chapter is the second of three equal thirds.
    let chapters = server
        .get_json(&format!("/files/{file_id}/chapters"), &admin)
        .await;
    let body_chapter = chapters["data"][1]["id"].as_str().unwrap();
    assert_eq!(chapters["data"][1]["label"], "Body");

    let reply: Value = server
        .post_json(
            &format!("/files/{file_id}/chapters/{body_chapter}/stream-url"),
            &admin,
            json!({ "expiresIn": 600 }),
        )
        .await
        .json()
        .await
        .unwrap();
    let stream_url = reply["streamUrl"].as_str().unwrap().to_string();

    let response = server
        .authed(reqwest::Method::GET, &stream_url, &admin)
        .header("range", "bytes=0-4095")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), 4096);
    // Chapter "Body" starts at the file's second third.
    assert_eq!(&bytes[..], &content[100_000..104_096]);
}

#[tokio::test]
async fn signed_url_time_shift() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, content) = chaptered_fixture(&server, &admin).await;

    let reply: Value = server
        .post_json(
            &format!("/drm/signed-url/{file_id}"),
            &admin,
            json!({ "startTime": 45.0, "endTime": -1 }),
        )
        .await
        .json()
        .await
        .unwrap();
    let signed_url = reply["signedUrl"].as_str().unwrap().to_string();

    // 45s of 120s over 300_000 bytes: offset 112_500.
    let shift = 112_500usize;

    // No Range: 200 with the whole shifted remainder.
    let response = server
        .authed(reqwest::Method::GET, &signed_url, &admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), CONTENT_LEN - shift);
    assert_eq!(&bytes[..], &content[shift..]);

    // Range 0-0: one byte, the shifted starting byte.
    let response = server
        .authed(reqwest::Method::GET, &signed_url, &admin)
        .header("range", "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        &format!("bytes 0-0/{}", CONTENT_LEN - shift)
    );
    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), 1);
    assert_eq!(bytes[0], content[shift]);
}

#[tokio::test]
async fn invalid_window_is_rejected_at_issuance() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let content = patterned_bytes(10_000);
    let file_id = server.upload_file(&admin, &content, 5_000, 60.0).await;

    for (start, end) in [(-5.0, -1.0), (60.0, -1.0), (30.0, 10.0)] {
        let response = server
            .post_json(
                &format!("/drm/signed-url/{file_id}"),
                &admin,
                json!({ "startTime": start, "endTime": end }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "window ({start},{end})");
    }
}

#[tokio::test]
async fn unsatisfiable_range_is_416_with_total() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, _) = chaptered_fixture(&server, &admin).await;
    let token = session_token(&server, &admin, &file_id).await;

    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .header("range", format!("bytes={CONTENT_LEN}-"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers().get("content-range").unwrap(),
        &format!("bytes */{CONTENT_LEN}")
    );
}

#[tokio::test]
async fn non_chaptered_file_streams_original_bytes() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let content = patterned_bytes(50_000);
    let file_id = server.upload_file(&admin, &content, 20_000, 60.0).await;

    let token = session_token(&server, &admin, &file_id).await;
    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .header("range", "bytes=10000-19999")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(&bytes[..], &content[10_000..20_000]);
}

#[tokio::test]
async fn token_is_bound_to_its_session() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, _) = chaptered_fixture(&server, &admin).await;
    let token = session_token(&server, &admin, &file_id).await;

    // A different user (different session and device) cannot redeem it.
    let other = server.register("other@example.com", "o1").await;
    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &other)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // No bearer at all: 401, regardless of token validity.
    let response = server
        .client
        .get(server.url(&format!("/drm/stream/{token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn key_rotation_invalidates_outstanding_tokens() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, _) = chaptered_fixture(&server, &admin).await;
    let token = session_token(&server, &admin, &file_id).await;

    let response = server
        .post_json("/admin/keys/rotate", &admin, json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_TOKEN");

    // Re-issuing after rotation works.
    let token = session_token(&server, &admin, &file_id).await;
    let response = server
        .authed(reqwest::Method::GET, &format!("/drm/stream/{token}"), &admin)
        .header("range", "bytes=0-0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
}

#[tokio::test]
async fn private_file_needs_grant() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let viewer = server.register("viewer@example.com", "v1").await;
    let (file_id, _) = chaptered_fixture(&server, &admin).await;

    // No grant: issuance is refused.
    let response = server
        .post_json(&format!("/drm/session/{file_id}"), &viewer, json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Grant access, then it works.
    let response = server
        .post_json(
            "/admin/file-access",
            &admin,
            json!({ "userId": viewer.user_id, "fileId": file_id }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .post_json(&format!("/drm/session/{file_id}"), &viewer, json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tampered_chapter_fails_stream_but_peers_survive() {
    let server = TestServer::spawn().await;
    let admin = server.register("admin@example.com", "a1").await;
    let (file_id, content) = chaptered_fixture(&server, &admin).await;

    // Corrupt the middle chapter's ciphertext on disk.
    let chapters = server
        .get_json(&format!("/files/{file_id}/chapters"), &admin)
        .await;
    let body_chapter = chapters["data"][1]["id"].as_str().unwrap().to_string();
    let enc_path = server
        .chapter_storage_root()
        .join(&file_id)
        .join(format!("{body_chapter}.enc"));
    let mut blob = tokio::fs::read(&enc_path).await.unwrap();
    let mid = blob.len() / 2;
    blob[mid] ^= 0x01;
    tokio::fs::write(&enc_path, &blob).await.unwrap();

    // Streaming the tampered chapter fails up front with a 5xx.
    let reply: Value = server
        .post_json(
            &format!("/files/{file_id}/chapters/{body_chapter}/stream-url"),
            &admin,
            json!({}),
        )
        .await
        .json()
        .await
        .unwrap();
    let stream_url = reply["streamUrl"].as_str().unwrap().to_string();
    let response = server
        .authed(reqwest::Method::GET, &stream_url, &admin)
        .header("range", "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "DECRYPT_FAILED");

    // The chapter row flips to failed shortly after.
    let mut failed = false;
    for _ in 0..50 {
        let status = server
            .get_json(&format!("/files/{file_id}/chapters/status"), &admin)
            .await;
        if status["data"]["failed"] == 1 {
            failed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(failed, "tampered chapter was not marked failed");

    // Other chapters of the same file remain streamable.
    let first_chapter = chapters["data"][0]["id"].as_str().unwrap();
    let reply: Value = server
        .post_json(
            &format!("/files/{file_id}/chapters/{first_chapter}/stream-url"),
            &admin,
            json!({}),
        )
        .await
        .json()
        .await
        .unwrap();
    let stream_url = reply["streamUrl"].as_str().unwrap().to_string();
    let response = server
        .authed(reqwest::Method::GET, &stream_url, &admin)
        .header("range", "bytes=0-999")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(&bytes[..], &content[..1000]);
}
