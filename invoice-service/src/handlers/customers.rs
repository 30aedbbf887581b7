//! Customer handlers. All operations are scoped to the authenticated owner.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

use crate::{
    dtos::{CreateCustomerRequest, ListCustomersQuery, UpdateCustomerRequest},
    middleware::AuthContext,
    models::{CreateCustomer, Customer, UpdateCustomer},
    AppState,
};

pub async fn create_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<Customer>), AppError> {
    payload.validate()?;

    let customer = state
        .db
        .create_customer(&CreateCustomer {
            user_id: auth.user_id,
            name: payload.name,
            email: payload.email,
            phone: payload.phone,
            address: payload.address,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn list_customers(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListCustomersQuery>,
) -> Result<Json<Vec<Customer>>, AppError> {
    let customers = state
        .db
        .list_customers(
            auth.user_id,
            query.page_size.unwrap_or(50),
            query.page_token,
        )
        .await?;

    Ok(Json(customers))
}

pub async fn get_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<i64>,
) -> Result<Json<Customer>, AppError> {
    let customer = state
        .db
        .get_customer(auth.user_id, customer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;

    Ok(Json(customer))
}

pub async fn update_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<i64>,
    Json(payload): Json<UpdateCustomerRequest>,
) -> Result<Json<Customer>, AppError> {
    payload.validate()?;

    let customer = state
        .db
        .update_customer(
            auth.user_id,
            customer_id,
            &UpdateCustomer {
                name: payload.name,
                email: payload.email,
                phone: payload.phone,
                address: payload.address,
            },
        )
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;

    Ok(Json(customer))
}

pub async fn delete_customer(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(customer_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let deleted = state.db.delete_customer(auth.user_id, customer_id).await?;
    if !deleted {
        return Err(AppError::NotFound(anyhow::anyhow!("Customer not found")));
    }

    Ok(StatusCode::NO_CONTENT)
}
