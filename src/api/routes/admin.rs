use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::api::extract::AdminUser;
use crate::api::response::ApiResult;
use crate::api::AppState;
use crate::error::{PhishError, Result};
use crate::models::{EmailStatus, RiskLevel};
use crate::store::{EmailFilter, EmailSort};

const MAX_PAGE_SIZE: u32 = 100;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/emails", get(list_emails))
        .route("/emails/:id", get(get_email))
        .route("/emails/:id/status", patch(update_status))
        .route("/stats", get(stats))
        .route("/users", get(list_users))
        .route("/users/:id/gmail/disconnect", post(disconnect_user_gmail))
}

/// Raw query values; parsed so a bad value yields a 400 with a clear message
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailQuery {
    risk: Option<String>,
    user_id: Option<String>,
    status: Option<String>,
    flagged: Option<String>,
    sort: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
}

impl EmailQuery {
    fn into_filter(self) -> Result<EmailFilter> {
        let defaults = EmailFilter::default();
        Ok(EmailFilter {
            user_id: self.user_id.filter(|id| !id.is_empty()),
            risk: self
                .risk
                .filter(|r| !r.is_empty())
                .map(|r| r.parse::<RiskLevel>())
                .transpose()?,
            status: self
                .status
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<EmailStatus>())
                .transpose()?,
            flagged_only: self.flagged.as_deref() == Some("true"),
            sort: self
                .sort
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<EmailSort>())
                .transpose()?
                .unwrap_or_default(),
            page: self.page.unwrap_or(defaults.page).max(1),
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
        })
    }
}

async fn list_emails(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<EmailQuery>,
) -> ApiResult<impl IntoResponse> {
    let page = state.db.list_emails(query.into_filter()?).await?;
    Ok(Json(json!({
        "success": true,
        "total": page.total,
        "page": page.page,
        "pages": page.pages,
        "emails": page.items,
    })))
}

async fn get_email(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let email = state
        .db
        .find_email(&id)
        .await?
        .ok_or_else(|| PhishError::NotFound("Email".to_string()))?;
    Ok(Json(json!({ "success": true, "email": email })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    #[serde(default)]
    status: String,
    admin_note: Option<String>,
}

async fn update_status(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<impl IntoResponse> {
    let status: EmailStatus = update.status.parse()?;
    let email = state
        .db
        .update_email_status(&id, status, update.admin_note, &admin.0.id)
        .await?;
    info!(email_id = %id, status = status.as_str(), admin_id = %admin.0.id, "Email status updated");
    Ok(Json(json!({ "success": true, "email": email })))
}

async fn stats(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<impl IntoResponse> {
    let stats = state.db.email_stats(None).await?;
    let by_user = state.db.email_counts_by_user().await?;
    Ok(Json(json!({
        "success": true,
        "total": stats.total,
        "flagged": stats.flagged,
        "byRisk": stats.by_risk,
        "byStatus": stats.by_status,
        "byUser": by_user,
    })))
}

async fn list_users(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<impl IntoResponse> {
    let users = state.db.list_users().await?;
    Ok(Json(json!({ "success": true, "count": users.len(), "users": users })))
}

async fn disconnect_user_gmail(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if state.db.find_user(&id).await?.is_none() {
        return Err(PhishError::NotFound("User".to_string()).into());
    }
    state.tokens.disconnect(&id).await?;
    info!(user_id = %id, admin_id = %admin.0.id, "Gmail disconnected by administrator");
    Ok(Json(json!({ "success": true, "message": "Gmail disconnected" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EmailSortField;

    #[test]
    fn test_query_defaults() {
        let filter = EmailQuery::default().into_filter().unwrap();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, 20);
        assert!(!filter.flagged_only);
        assert_eq!(filter.sort.field, EmailSortField::AnalyzedAt);
        assert!(filter.sort.descending);
    }

    #[test]
    fn test_query_parsing() {
        let filter = EmailQuery {
            risk: Some("High".into()),
            status: Some("Quarantined".into()),
            flagged: Some("true".into()),
            sort: Some("-score".into()),
            page: Some(0),
            limit: Some(1000),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.risk, Some(RiskLevel::High));
        assert_eq!(filter.status, Some(EmailStatus::Quarantined));
        assert!(filter.flagged_only);
        assert_eq!(filter.sort.field, EmailSortField::Score);
        assert_eq!(filter.page, 1);
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_bad_query_value_rejected() {
        let query = EmailQuery {
            risk: Some("extreme".into()),
            ..Default::default()
        };
        assert!(matches!(query.into_filter(), Err(PhishError::BadRequest(_))));
    }
}
