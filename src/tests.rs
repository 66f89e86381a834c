use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use poem::http::{header, StatusCode};
use poem::test::TestClient;
use poem::Endpoint;
use tempfile::TempDir;

use crate::config::{OutputFormat, RuntimeConfig};
use crate::errors::TracingReporter;
use crate::processor::encoder::encode_to;
use crate::response::FALLBACK_WARNING;
use crate::storage::backends::{BackendConfigs, DatastoreConfig};
use crate::{routes, startup};

const FILESYSTEM_CONFIG: &str = include_str!("../tests/configs/filesystem.yaml");

async fn setup_environment(cfg: &str) -> anyhow::Result<(TestClient<impl Endpoint>, TempDir)> {
    let dir = tempfile::tempdir()?;

    let mut cfg = RuntimeConfig::from_yaml(cfg)?;
    cfg.datastores = vec![DatastoreConfig {
        enabled: true,
        backend: BackendConfigs::File {
            directory: dir.path().join("media"),
        },
    }];

    let controller = startup::bootstrap(cfg, Arc::new(TracingReporter)).await?;
    let app = routes::build_app(controller, "http://127.0.0.1:8000");

    Ok((TestClient::new(app), dir))
}

fn test_image(width: u32, height: u32) -> anyhow::Result<Bytes> {
    encode_to(&DynamicImage::new_rgb8(width, height), OutputFormat::Png)
}

async fn upload<E: Endpoint>(app: &TestClient<E>, data: Bytes) -> String {
    let res = app
        .post("/media/upload/example.org")
        .body(data)
        .content_type("application/octet-stream".to_string())
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    let info = res.json().await;

    info.value().object().get("media_id").string().to_string()
}

#[tokio::test]
async fn test_upload_then_thumbnail() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let media_id = upload(&app, test_image(1000, 500)?).await;

    let res = app
        .get(format!(
            "/media/thumbnail/example.org/{}?width=96&height=96&method=crop",
            media_id
        ))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    res.assert_content_type("image/png");
    assert!(res.0.headers().get(header::WARNING).is_none());

    let data = res.0.into_body().into_bytes().await?;
    let decoded = image::load_from_memory(&data)?;
    assert_eq!((decoded.width(), decoded.height()), (96, 96));

    Ok(())
}

#[tokio::test]
async fn test_thumbnail_uses_default_size() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let media_id = upload(&app, test_image(400, 400)?).await;

    let res = app
        .get(format!("/media/thumbnail/example.org/{}", media_id))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    let data = res.0.into_body().into_bytes().await?;
    let decoded = image::load_from_memory(&data)?;
    assert_eq!((decoded.width(), decoded.height()), (32, 32));

    Ok(())
}

#[tokio::test]
async fn test_unknown_media_is_not_found() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;

    let res = app
        .get("/media/thumbnail/example.org/abc123?width=96&height=96")
        .send()
        .await;
    res.assert_status(StatusCode::NOT_FOUND);

    let body = res.json().await;
    assert_eq!(body.value().object().get("errcode").string(), "M_NOT_FOUND");

    let res = app.get("/media/download/example.org/abc123").send().await;
    res.assert_status(StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_bad_thumbnail_parameters() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let media_id = upload(&app, test_image(100, 100)?).await;

    for query in ["width=abc", "height=1.5", "width=0", "width=-4", "method=stretch"] {
        let res = app
            .get(format!("/media/thumbnail/example.org/{}?{}", media_id, query))
            .send()
            .await;
        res.assert_status(StatusCode::BAD_REQUEST);
    }

    Ok(())
}

#[tokio::test]
async fn test_thumbnail_beyond_configured_sizes_is_rejected() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let media_id = upload(&app, test_image(100, 100)?).await;

    for query in [
        "width=4294967295&height=4294967295&method=crop",
        "width=321&height=240",
        "width=320&height=241&method=scale",
    ] {
        let res = app
            .get(format!("/media/thumbnail/example.org/{}?{}", media_id, query))
            .send()
            .await;
        res.assert_status(StatusCode::BAD_REQUEST);

        let body = res.json().await;
        assert_eq!(body.value().object().get("errcode").string(), "M_BAD_REQUEST");
    }

    let res = app
        .get(format!(
            "/media/thumbnail/example.org/{}?width=320&height=240&method=scale",
            media_id
        ))
        .send()
        .await;
    res.assert_status(StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn test_download_over_limit() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let media_id = upload(&app, Bytes::from(vec![7u8; 1536 * 1024])).await;

    let res = app
        .get(format!("/media/download/example.org/{}", media_id))
        .send()
        .await;
    res.assert_status(StatusCode::PAYLOAD_TOO_LARGE);

    let res = app
        .get(format!("/media/thumbnail/example.org/{}", media_id))
        .send()
        .await;
    res.assert_status(StatusCode::PAYLOAD_TOO_LARGE);

    Ok(())
}

#[tokio::test]
async fn test_download_returns_original_bytes() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let original = test_image(64, 64)?;
    let media_id = upload(&app, original.clone()).await;

    let res = app
        .get(format!("/media/download/example.org/{}", media_id))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    res.assert_content_type("image/png");
    assert_eq!(res.0.into_body().into_bytes().await?, original);

    Ok(())
}

#[tokio::test]
async fn test_too_large_to_thumbnail_serves_original() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;
    let original = Bytes::from(vec![1u8; 600 * 1024]);
    let media_id = upload(&app, original.clone()).await;

    let res = app
        .get(format!(
            "/media/thumbnail/example.org/{}?width=96&height=96",
            media_id
        ))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    res.assert_content_type("application/octet-stream");

    let warning = res
        .0
        .headers()
        .get(header::WARNING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    assert_eq!(warning.as_deref(), Some(FALLBACK_WARNING));
    assert_eq!(res.0.into_body().into_bytes().await?, original);

    Ok(())
}

#[tokio::test]
async fn test_empty_upload_is_rejected() -> anyhow::Result<()> {
    let (app, _dir) = setup_environment(FILESYSTEM_CONFIG).await?;

    let res = app
        .post("/media/upload/example.org")
        .body(Vec::<u8>::new())
        .content_type("application/octet-stream".to_string())
        .send()
        .await;
    res.assert_status(StatusCode::BAD_REQUEST);

    Ok(())
}
