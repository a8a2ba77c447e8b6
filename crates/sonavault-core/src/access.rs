//! File authorization.

use chrono::{DateTime, Utc};

use crate::auth::{Role, User};
use crate::library::{AudioFile, FileAccess, Visibility};

/// Whether `user` may view `file`.
///
/// Authorization = public visibility, or a live grant, or admin role, or
/// being the uploader.
pub fn can_view(
    user: &User,
    file: &AudioFile,
    grant: Option<&FileAccess>,
    now: DateTime<Utc>,
) -> bool {
    if file.visibility == Visibility::Public {
        return true;
    }
    if user.role == Role::Admin || file.uploader_id == user.id {
        return true;
    }
    grant.is_some_and(|g| g.is_live(now))
}
