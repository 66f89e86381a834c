use std::sync::Arc;

use bytes::Bytes;
use poem::middleware::Tracing;
use poem::web::{Data, Path, Query};
use poem::{get, handler, Endpoint, EndpointExt, Response, Route};
use poem_openapi::payload::{Binary, Json, PlainText};
use poem_openapi::{param, ApiResponse, OpenApi, OpenApiService};
use serde::Deserialize;

use crate::controller::{MediaController, ServeError, UploadInfo};
use crate::response::served_response;

#[derive(Debug, Default, Deserialize)]
pub struct ThumbnailParams {
    width: Option<String>,
    height: Option<String>,
    method: Option<String>,
}

#[handler]
pub async fn get_thumbnail(
    Path((server, media_id)): Path<(String, String)>,
    Query(params): Query<ThumbnailParams>,
    controller: Data<&Arc<MediaController>>,
) -> Response {
    let res = controller
        .thumbnail(
            &server,
            &media_id,
            params.width.as_deref(),
            params.height.as_deref(),
            params.method.as_deref(),
        )
        .await;

    served_response(res)
}

#[handler]
pub async fn get_download(
    Path((server, media_id)): Path<(String, String)>,
    controller: Data<&Arc<MediaController>>,
) -> Response {
    served_response(controller.download(&server, &media_id).await)
}

#[derive(ApiResponse)]
pub enum UploadResponse {
    /// The media was stored.
    #[oai(status = 200)]
    Ok(Json<UploadInfo>),

    /// The upload was empty or the server name missing.
    #[oai(status = 400)]
    BadRequest(PlainText<String>),

    /// The upload exceeds the configured upload limit.
    #[oai(status = 413)]
    TooLarge(PlainText<String>),

    /// The media could not be stored.
    #[oai(status = 500)]
    InternalServerError(PlainText<String>),
}

pub struct MediaApi {
    controller: Arc<MediaController>,
}

impl MediaApi {
    pub fn new(controller: Arc<MediaController>) -> Self {
        Self { controller }
    }
}

#[OpenApi]
impl MediaApi {
    /// Upload Media
    ///
    /// Stores the raw request body as new media owned by the given server.
    /// The content type is detected from the uploaded bytes.
    #[oai(path = "/:server", method = "post")]
    async fn upload(&self, server: param::Path<String>, file: Binary<Vec<u8>>) -> UploadResponse {
        match self.controller.upload(&server.0, Bytes::from(file.0)).await {
            Ok(info) => UploadResponse::Ok(Json(info)),
            Err(ServeError::BadInput(msg)) => UploadResponse::BadRequest(PlainText(msg)),
            Err(ServeError::TooLarge(msg)) => UploadResponse::TooLarge(PlainText(msg)),
            Err(ServeError::NotFound) | Err(ServeError::Internal) => UploadResponse::InternalServerError(
                PlainText("Unexpected error, please try again later".to_string()),
            ),
        }
    }
}

/// Builds the full application, docs included.
pub fn build_app(controller: Arc<MediaController>, docs_url: &str) -> impl Endpoint {
    let api_service = OpenApiService::new(
        MediaApi::new(controller.clone()),
        "Media Repository API",
        env!("CARGO_PKG_VERSION"),
    )
    .server(format!("{}/media/upload", docs_url.trim_end_matches('/')));

    let ui = api_service.redoc();

    Route::new()
        .at("/media/thumbnail/:server/:media_id", get(get_thumbnail))
        .at("/media/download/:server/:media_id", get(get_download))
        .nest("/media/upload", api_service)
        .nest("/docs", ui)
        .data(controller)
        .with(Tracing)
}
