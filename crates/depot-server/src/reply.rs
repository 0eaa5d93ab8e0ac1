//! Canonical HTTP replies. Every user-visible error string is a
//! literal constant; backend detail goes to the logs only.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

pub fn ok_text(content_type: &'static str, body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, body.len().to_string()),
        ],
        body,
    )
        .into_response()
}

pub fn created() -> Response {
    StatusCode::CREATED.into_response()
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

pub fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "bad request").into_response()
}

pub fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

pub fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()
}

pub fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

pub fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "authorization required").into_response()
}

pub fn invalid_token() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid authorization token").into_response()
}

pub fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "insufficient permissions").into_response()
}
