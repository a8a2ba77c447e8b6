//! Chunked upload integration tests.

mod common;

use common::{TestServer, patterned_bytes, sha256_hex};
use reqwest::StatusCode;
use serde_json::{Value, json};

#[tokio::test]
async fn resumable_upload_round_trips() {
    let server = TestServer::spawn().await;
    let account = server.register("uploader@example.com", "d1").await;

    // Three chunks; upload 0 and 2, "crash", resume, then finalize.
    let content = patterned_bytes(300_000);
    let chunks: Vec<&[u8]> = content.chunks(100_000).collect();

    let init: Value = server
        .post_json(
            "/audio/upload/init",
            &account,
            json!({
                "fileName": "book.mp3",
                "fileSize": content.len(),
                "totalChunks": 3,
                "fileHash": sha256_hex(&content),
                "mimeType": "audio/mpeg",
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let upload_id = init["data"]["uploadId"].as_str().unwrap().to_string();

    server.put_chunk(&account, &upload_id, 0, chunks[0]).await;
    server.put_chunk(&account, &upload_id, 2, chunks[2]).await;

    // Resume: status reports which indices arrived.
    let status = server
        .get_json(&format!("/audio/upload/status/{upload_id}"), &account)
        .await;
    assert_eq!(status["data"]["receivedCount"], 2);
    assert_eq!(status["data"]["uploadedChunks"], json!([0, 2]));

    server.put_chunk(&account, &upload_id, 1, chunks[1]).await;

    let form = reqwest::multipart::Form::new().text("durationSeconds", "120");
    let response = server
        .authed(
            reqwest::Method::POST,
            &format!("/audio/upload/finalize/{upload_id}"),
            &account,
        )
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    let file_id = body["data"]["id"].as_str().unwrap();
    assert_eq!(body["data"]["size"], content.len());
    assert_eq!(body["data"]["sha256"], sha256_hex(&content));

    // Metadata is durable.
    let file = server.get_json(&format!("/files/{file_id}"), &account).await;
    assert_eq!(file["data"]["size"], content.len());
    assert_eq!(file["data"]["sha256"], sha256_hex(&content));
}

#[tokio::test]
async fn conflicting_chunk_rewrite_is_409() {
    let server = TestServer::spawn().await;
    let account = server.register("uploader@example.com", "d1").await;
    let content = patterned_bytes(10_000);

    let init: Value = server
        .post_json(
            "/audio/upload/init",
            &account,
            json!({
                "fileName": "x.mp3",
                "fileSize": content.len(),
                "totalChunks": 1,
                "fileHash": sha256_hex(&content),
                "mimeType": "audio/mpeg",
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let upload_id = init["data"]["uploadId"].as_str().unwrap().to_string();

    let ok = server.put_chunk(&account, &upload_id, 0, &content).await;
    assert_eq!(ok.status(), StatusCode::OK);

    // Identical repeat succeeds.
    let repeat = server.put_chunk(&account, &upload_id, 0, &content).await;
    assert_eq!(repeat.status(), StatusCode::OK);

    // Different bytes for the same index conflict.
    let other = patterned_bytes(10_001);
    let conflict = server
        .put_chunk(&account, &upload_id, 0, &other[..10_000])
        .await;
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    let body: Value = conflict.json().await.unwrap();
    assert_eq!(body["error"]["code"], "CHUNK_CONFLICT");
}

#[tokio::test]
async fn integrity_mismatch_aborts_upload() {
    let server = TestServer::spawn().await;
    let account = server.register("uploader@example.com", "d1").await;
    let content = patterned_bytes(5_000);

    let init: Value = server
        .post_json(
            "/audio/upload/init",
            &account,
            json!({
                "fileName": "x.mp3",
                "fileSize": content.len(),
                "totalChunks": 1,
                "fileHash": sha256_hex(b"not the content"),
                "mimeType": "audio/mpeg",
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let upload_id = init["data"]["uploadId"].as_str().unwrap().to_string();
    server.put_chunk(&account, &upload_id, 0, &content).await;

    let form = reqwest::multipart::Form::new().text("durationSeconds", "10");
    let response = server
        .authed(
            reqwest::Method::POST,
            &format!("/audio/upload/finalize/{upload_id}"),
            &account,
        )
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INTEGRITY_FAILED");

    // The session is terminal now: further chunks are rejected.
    let late = server.put_chunk(&account, &upload_id, 0, &content).await;
    assert_eq!(late.status(), StatusCode::CONFLICT);
    let body: Value = late.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UPLOAD_BUSY");
}

#[tokio::test]
async fn cancel_then_status_reports_terminal_state() {
    let server = TestServer::spawn().await;
    let account = server.register("uploader@example.com", "d1").await;

    let init: Value = server
        .post_json(
            "/audio/upload/init",
            &account,
            json!({
                "fileName": "x.mp3",
                "fileSize": 100,
                "totalChunks": 1,
                "fileHash": sha256_hex(b"irrelevant"),
                "mimeType": "audio/mpeg",
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let upload_id = init["data"]["uploadId"].as_str().unwrap().to_string();

    let response = server
        .authed(
            reqwest::Method::DELETE,
            &format!("/audio/upload/cancel/{upload_id}"),
            &account,
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server
        .authed(
            reqwest::Method::GET,
            &format!("/audio/upload/status/{upload_id}"),
            &account,
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn foreign_upload_is_forbidden() {
    let server = TestServer::spawn().await;
    let _admin = server.register("admin@example.com", "a1").await;
    let owner = server.register("owner@example.com", "o1").await;
    let other = server.register("other@example.com", "x1").await;

    let init: Value = server
        .post_json(
            "/audio/upload/init",
            &owner,
            json!({
                "fileName": "x.mp3",
                "fileSize": 100,
                "totalChunks": 1,
                "fileHash": sha256_hex(b"abc"),
                "mimeType": "audio/mpeg",
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let upload_id = init["data"]["uploadId"].as_str().unwrap().to_string();

    let response = server
        .authed(
            reqwest::Method::GET,
            &format!("/audio/upload/status/{upload_id}"),
            &other,
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
