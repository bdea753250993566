use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use super::domain::{
    ApplicationId, ApplicationSubmission, ApplicationUpdate, FlaggedSetId, RequestContext, UserId,
};
use super::repository::{ConfirmationNotifier, FlaggingDatabase, ListingDirectory};
use super::service::{
    ApplicationGateway, ApplicationListQuery, ApplicationServiceError, FlaggedSetQuery,
    ResolveRequest,
};

/// Header carrying the authenticated caller, set by the upstream auth layer.
pub const ACTING_USER_HEADER: &str = "x-user-id";

type Gateway<D, L, N> = Arc<ApplicationGateway<D, L, N>>;

/// Router builder exposing application intake and flagged-set review endpoints.
pub fn application_router<D, L, N>(gateway: Gateway<D, L, N>) -> Router
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    Router::new()
        .route(
            "/api/v1/applications/submit",
            post(submit_handler::<D, L, N>),
        )
        .route(
            "/api/v1/applications",
            post(create_handler::<D, L, N>).get(list_handler::<D, L, N>),
        )
        .route(
            "/api/v1/applications/:application_id",
            get(get_handler::<D, L, N>)
                .put(update_handler::<D, L, N>)
                .delete(withdraw_handler::<D, L, N>),
        )
        .route(
            "/api/v1/application-flagged-sets",
            get(list_sets_handler::<D, L, N>),
        )
        .route(
            "/api/v1/application-flagged-sets/resolve",
            post(resolve_handler::<D, L, N>),
        )
        .route(
            "/api/v1/application-flagged-sets/:set_id",
            get(get_set_handler::<D, L, N>),
        )
        .with_state(gateway)
}

pub(crate) async fn submit_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Json(submission): Json<ApplicationSubmission>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.submit(ctx, submission).await {
        Ok(application) => (StatusCode::CREATED, Json(application)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn create_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Json(submission): Json<ApplicationSubmission>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.create(ctx, submission).await {
        Ok(application) => (StatusCode::CREATED, Json(application)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn list_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Query(query): Query<ApplicationListQuery>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.list(ctx, query).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn get_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Path(application_id): Path<Uuid>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.get(ctx, ApplicationId(application_id)).await {
        Ok(application) => (StatusCode::OK, Json(application)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn update_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Path(application_id): Path<Uuid>,
    Json(patch): Json<ApplicationUpdate>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway
        .update(ctx, ApplicationId(application_id), patch)
        .await
    {
        Ok(application) => (StatusCode::OK, Json(application)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn withdraw_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Path(application_id): Path<Uuid>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.withdraw(ctx, ApplicationId(application_id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn list_sets_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Query(query): Query<FlaggedSetQuery>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.list_flagged_sets(ctx, query).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn get_set_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Path(set_id): Path<Uuid>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.get_flagged_set(ctx, FlaggedSetId(set_id)).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn resolve_handler<D, L, N>(
    State(gateway): State<Gateway<D, L, N>>,
    headers: HeaderMap,
    Json(request): Json<ResolveRequest>,
) -> Response
where
    D: FlaggingDatabase + 'static,
    L: ListingDirectory + 'static,
    N: ConfirmationNotifier + 'static,
{
    let ctx = match request_context(&headers) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };
    match gateway.resolve(ctx, request).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

fn request_context(headers: &HeaderMap) -> Result<RequestContext, Response> {
    let Some(raw) = headers.get(ACTING_USER_HEADER) else {
        return Ok(RequestContext::new(None));
    };
    let acting_user = raw
        .to_str()
        .ok()
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .map(UserId)
        .ok_or_else(|| {
            let payload = json!({ "error": format!("{ACTING_USER_HEADER} must be a UUID") });
            (StatusCode::BAD_REQUEST, Json(payload)).into_response()
        })?;
    Ok(RequestContext::new(Some(acting_user)))
}

/// Maps gateway failures onto the HTTP error contract.
pub fn error_response(error: ApplicationServiceError) -> Response {
    match error {
        ApplicationServiceError::Validation(error) => {
            let payload = json!({ "error": error.to_string() });
            (StatusCode::BAD_REQUEST, Json(payload)).into_response()
        }
        ApplicationServiceError::NotFound { .. } => {
            let payload = json!({ "error": error.to_string() });
            (StatusCode::NOT_FOUND, Json(payload)).into_response()
        }
        ApplicationServiceError::RateLimited { .. } => {
            let payload = json!({
                "statusCode": 429,
                "error": "Too Many Requests",
                "message": "Please try again later.",
            });
            (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
        }
        other => {
            let payload = json!({ "error": other.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
        }
    }
}
