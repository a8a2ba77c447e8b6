//! JSON projections of core entities.
//!
//! Response bodies expose exactly what a client needs; verifiers, token
//! hashes, key material, and server paths never appear here.

use serde_json::{Value, json};

use sonavault_core::auth::{Device, Session, User};
use sonavault_core::chapter::{Chapter, ChapterStatusSummary};
use sonavault_core::library::{AudioFile, CoverImage, FileAccess};

pub fn user_json(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "name": user.name,
        "role": user.role,
        "locked": user.locked,
        "createdAt": user.created_at,
    })
}

pub fn device_json(device: &Device) -> Value {
    json!({
        "id": device.id,
        "deviceId": device.client_device_id,
        "deviceName": device.name,
        "deviceType": device.device_type,
        "active": device.active,
        "firstSeen": device.first_seen,
        "lastActivity": device.last_activity,
    })
}

pub fn session_json(session: &Session) -> Value {
    json!({
        "id": session.id,
        "deviceId": session.device_id,
        "issuedAt": session.issued_at,
        "expiresAt": session.expires_at,
        "revoked": session.revoked,
    })
}

pub fn file_json(file: &AudioFile, chapters: &ChapterStatusSummary) -> Value {
    json!({
        "id": file.id,
        "title": file.title,
        "uploaderId": file.uploader_id,
        "sha256": file.sha256,
        "size": file.size,
        "mimeType": file.mime_type,
        "duration": file.duration_seconds,
        "visibility": file.visibility,
        "hasCover": file.cover.is_some(),
        "coverInline": match &file.cover {
            Some(CoverImage::Inline(data)) => Some(data.clone()),
            _ => None,
        },
        "chaptered": chapters.ready > 0,
        "chapters": chapter_summary_json(chapters),
        "createdAt": file.created_at,
    })
}

pub fn chapter_summary_json(summary: &ChapterStatusSummary) -> Value {
    json!({
        "pending": summary.pending,
        "ready": summary.ready,
        "failed": summary.failed,
    })
}

pub fn chapter_json(chapter: &Chapter) -> Value {
    json!({
        "id": chapter.id,
        "fileId": chapter.file_id,
        "ordinal": chapter.ordinal,
        "label": chapter.label,
        "startTime": chapter.start_seconds,
        "endTime": chapter.end_seconds,
        "status": chapter.status,
        "plainSize": chapter.plain_size,
        "encryptedSize": chapter.encrypted_size,
        "scheme": chapter.scheme,
        "keyForm": chapter.key_form.as_ref().map(|k| k.as_str()),
        "finalizedAt": chapter.finalized_at,
        "errorCode": chapter.error_code,
    })
}

pub fn grant_json(grant: &FileAccess) -> Value {
    json!({
        "id": grant.id,
        "userId": grant.user_id,
        "fileId": grant.file_id,
        "canView": grant.can_view,
        "expiresAt": grant.expires_at,
        "grantedAt": grant.granted_at,
    })
}
