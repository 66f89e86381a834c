use poem::http::{header, StatusCode};
use poem::Response;
use serde_json::json;

use crate::controller::{ServeError, ServedMedia};

/// The warning attached to responses serving original media in place
/// of a thumbnail.
pub const FALLBACK_WARNING: &str = "199 - \"Thumbnail could not be derived, serving original media\"";

/// A standard JSON error response with the content type set to application/json
pub fn json_response(status: StatusCode, errcode: &str, msg: &str) -> Response {
    let payload = json!({
        "errcode": errcode,
        "error": msg,
    });

    Response::builder()
        .status(status)
        .content_type("application/json")
        .body(payload.to_string())
}

pub fn media_response(media: ServedMedia) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .content_type(media.content_type)
        .header(header::CONTENT_LENGTH, media.data.len());

    let builder = if media.fallback {
        builder.header(header::WARNING, FALLBACK_WARNING)
    } else {
        builder
    };

    builder.body(media.data)
}

pub fn error_response(err: ServeError) -> Response {
    match err {
        ServeError::BadInput(msg) => json_response(StatusCode::BAD_REQUEST, "M_BAD_REQUEST", &msg),
        ServeError::NotFound => json_response(StatusCode::NOT_FOUND, "M_NOT_FOUND", "Media not found"),
        ServeError::TooLarge(msg) => json_response(StatusCode::PAYLOAD_TOO_LARGE, "M_TOO_LARGE", &msg),
        ServeError::Internal => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "M_UNKNOWN",
            "Unexpected error, please try again later",
        ),
    }
}

pub fn served_response(res: Result<ServedMedia, ServeError>) -> Response {
    match res {
        Ok(media) => media_response(media),
        Err(e) => error_response(e),
    }
}
