//! In-app mirror
//!
//! Every chat delivery gets a matching in-app notification row so the web app
//! shows the same history. The mirror is best-effort: a failure is logged and
//! the chat delivery stands.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::database::Database;
use crate::message::MessageModel;

/// Write the in-app twin of a delivered message. Awaited (so failures are
/// observed and logged) but never propagated.
pub async fn mirror_to_in_app(
    db: &Database,
    user_id: &str,
    org_id: &str,
    model: &MessageModel,
    now: DateTime<Utc>,
) {
    if user_id.is_empty() {
        return;
    }
    let result = db
        .insert_in_app_notification(
            user_id,
            org_id,
            &model.category,
            model.feature.as_str(),
            &model.title,
            &model.plain_text(),
            model.action_url.as_deref(),
            &model.metadata,
            now,
        )
        .await;
    if let Err(e) = result {
        warn!(
            user_id = %user_id,
            feature = %model.feature,
            error = %e,
            "In-app mirror write failed"
        );
    }
}
