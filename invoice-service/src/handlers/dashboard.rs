//! Dashboard handler backing the SPA analytics view.

use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::{middleware::AuthContext, services::database::DashboardSummary, AppState};

pub async fn summary(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<DashboardSummary>, AppError> {
    let summary = state.db.dashboard_summary(auth.user_id).await?;

    Ok(Json(summary))
}
