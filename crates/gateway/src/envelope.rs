//! The `{success, data}` response envelope and the extractors that keep
//! malformed requests inside it.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hub::{ErrorKind, ErrorNote, HubError};

/// Every response body: `success` plus either the payload or an [`ErrorNote`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// `false` exactly when `data` is an [`ErrorNote`].
    pub success: bool,
    /// The payload, or what went wrong.
    pub data: T,
}

impl<T> Envelope<T> {
    /// A successful envelope around `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// What every handler returns.
pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Wraps a successful payload.
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(data)))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed request, rendered as `success = false`.
///
/// Domain failures answer HTTP 200 so that callers only ever inspect the
/// envelope. Requests that cannot be decoded answer 400.
#[derive(Debug)]
pub enum ApiError {
    /// The engine refused or failed the operation.
    Hub(HubError),
    /// The body, query or path could not be decoded.
    Malformed(String),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, note) = match &self {
            Self::Hub(err) => (StatusCode::OK, ErrorNote::from(err)),
            Self::Malformed(message) => (
                StatusCode::BAD_REQUEST,
                ErrorNote {
                    kind: ErrorKind::InvalidRequest,
                    message: message.clone(),
                },
            ),
        };
        debug!(kind = %note.kind, message = %note.message, "request failed");
        let body = Envelope {
            success: false,
            data: note,
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// JSON body whose rejection is an enveloped 400.
#[derive(Debug)]
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|e: JsonRejection| ApiError::Malformed(e.body_text()))
    }
}

/// Query string whose rejection is an enveloped 400.
#[derive(Debug)]
pub struct Params<T>(pub T);

impl<S, T> FromRequestParts<S> for Params<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| Self(value))
            .map_err(|e: QueryRejection| ApiError::Malformed(e.body_text()))
    }
}

/// Path captures whose rejection is an enveloped 400.
#[derive(Debug)]
pub struct Segments<T>(pub T);

impl<S, T> FromRequestParts<S> for Segments<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| Self(value))
            .map_err(|e: PathRejection| ApiError::Malformed(e.body_text()))
    }
}
