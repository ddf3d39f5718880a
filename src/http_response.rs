use actix_web::HttpResponse;
use anyhow::Result;
use log::{error, warn};
use serde::Serialize;

/// Malformed or out of range client input
///
/// Services return it wrapped in `anyhow::Error`; [`handle_service_result`]
/// maps it to `400 Bad Request` while every other error becomes a `500`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InputError(pub String);

impl InputError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Serialize the wrapped value as the JSON body of a `200 OK`
#[derive(Debug)]
pub struct Json<T>(pub T);

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for () {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().finish()
    }
}

impl ServiceResultResponse for String {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().body(self)
    }
}

impl ServiceResultResponse for &'static str {
    fn into_response(self) -> HttpResponse {
        HttpResponse::Ok().body(self)
    }
}

impl<T> ServiceResultResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> HttpResponse {
        match serde_json::to_string(&self.0) {
            Ok(json) => HttpResponse::Ok()
                .content_type("application/json")
                .body(json),
            Err(e) => {
                error!("failed to serialize response: {e:#}");
                HttpResponse::InternalServerError().body("failed to serialize response")
            }
        }
    }
}

/// Handle Result and convert its data to a Response
///
/// # Arguments
/// * `result` - The Result to handle
/// * `operation` - Context message describing the operation
///
/// # Returns
/// * `HttpResponse` - `200` with the data, `400` for an [`InputError`] or `500`
///   for anything else
pub fn handle_service_result<T>(result: Result<T>, operation: &str) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) if e.downcast_ref::<InputError>().is_some() => {
            warn!("{operation} rejected: {e:#}");
            HttpResponse::BadRequest().body(e.to_string())
        }
        Err(e) => {
            error!("{operation} failed: {e:#}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}
