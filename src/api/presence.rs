use std::collections::HashMap;

use axum::{extract::{Query, State}, Json};

use crate::errors::AppError;
use crate::middleware::AuthUser;
use crate::models::{OnlineStatus, PresenceEntry, PresenceQuery};
use crate::AppState;

/// Most ids answered by one lookup.
const MAX_PRESENCE_IDS: usize = 200;

/// Bulk presence check: returns online/offline status for a list of user IDs.
/// GET /api/v1/presence?user_ids=1,2,...
///
/// Ids that never connected are reported offline with no `last_seen`.
pub async fn get_presence(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Query(query): Query<PresenceQuery>,
) -> Result<Json<Vec<PresenceEntry>>, AppError> {
    let mut user_ids: Vec<i64> = query
        .user_ids
        .split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .collect();
    user_ids.sort_unstable();
    user_ids.dedup();
    user_ids.truncate(MAX_PRESENCE_IDS);

    if user_ids.is_empty() {
        return Ok(Json(vec![]));
    }

    let known: HashMap<i64, _> = state
        .presence
        .get_many(&user_ids)
        .await?
        .into_iter()
        .map(|p| (p.user_id, p))
        .collect();

    let entries = user_ids
        .into_iter()
        .map(|uid| match known.get(&uid) {
            Some(p) => PresenceEntry {
                user_id: uid,
                status: OnlineStatus::from(p.is_online),
                last_seen: Some(p.last_seen),
            },
            None => PresenceEntry {
                user_id: uid,
                status: OnlineStatus::Offline,
                last_seen: None,
            },
        })
        .collect();

    Ok(Json(entries))
}
