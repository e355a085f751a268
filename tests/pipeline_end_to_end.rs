//! Full pipeline runs against a local HTTP server and an in-memory store

mod common;

use common::{config, encode, memory_pipeline, serve, subject_image, uniform_image};
use image::ImageFormat;
use museum_cutout::{
    CutoutRequest, CutoutScope, ImageSource, NoDetectionPolicy, ObjectLocation, PipelineConfig,
    Reference, ReturnMode, TuningOverrides,
};

async fn jpeg_url(image: &image::RgbImage, path: &str) -> String {
    let addr = serve(200, "image/jpeg", encode(image, ImageFormat::Jpeg)).await;
    format!("http://{addr}/{path}")
}

fn stored_location(reference: &Reference) -> ObjectLocation {
    reference.location().cloned().expect("stored reference")
}

#[tokio::test]
async fn url_source_produces_transparent_png_of_source_size() {
    let (pipeline, store) = memory_pipeline(config());
    let url = jpeg_url(&subject_image(400, 300), "photos/vase.jpg").await;

    let outcome = pipeline
        .run(&CutoutRequest::new(ImageSource::Url(url)))
        .await
        .unwrap();

    assert!(!outcome.is_no_detection());
    assert!(outcome.detected_count() >= 1);
    assert_eq!(outcome.references().len(), 1);

    let location = stored_location(&outcome.references()[0]);
    assert_eq!(location.bucket, "scrapbook-media");
    assert!(location.key.starts_with("cutouts/vase-"), "{}", location.key);
    assert!(location.key.ends_with(".png"));

    let object = store.object(&location).await.unwrap();
    assert_eq!(object.content_type, "image/png");
    let png = image::load_from_memory_with_format(&object.bytes, ImageFormat::Png)
        .unwrap()
        .to_rgba8();
    assert_eq!(png.dimensions(), (400, 300));
    assert_eq!(png.get_pixel(5, 5).0[3], 0, "background is transparent");
    assert_eq!(png.get_pixel(200, 150).0[3], 255, "subject is opaque");

    let timings = &outcome.diagnostics().timings;
    assert!(timings.total_ms >= timings.inference_ms);
}

#[tokio::test]
async fn uniform_image_is_rejected_without_writing() {
    let (pipeline, store) = memory_pipeline(config());
    let url = jpeg_url(&uniform_image(120, 80), "wall.jpg").await;

    let outcome = pipeline
        .run(&CutoutRequest::new(ImageSource::Url(url)))
        .await
        .unwrap();

    assert!(outcome.is_no_detection());
    assert_eq!(outcome.detected_count(), 0);
    assert!(outcome.references().is_empty());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn presigned_url_honours_requested_expiry() {
    let (pipeline, _store) = memory_pipeline(config());
    let url = jpeg_url(&subject_image(90, 60), "vase.jpg").await;

    let request = CutoutRequest::new(ImageSource::Url(url)).with_overrides(TuningOverrides {
        presign_expires: Some(600),
        ..TuningOverrides::default()
    });
    let outcome = pipeline.run(&request).await.unwrap();

    let reference = &outcome.references()[0];
    let url = reference.url().unwrap();
    assert!(url.starts_with("memory://scrapbook-media/cutouts/vase-"), "{url}");
    assert!(url.contains("X-Amz-Expires=600"), "{url}");
    assert_eq!(outcome.diagnostics().config_used.presign_expires, 600);
}

#[tokio::test]
async fn inline_mode_returns_png_without_storing() {
    let config = PipelineConfig::builder()
        .bucket("scrapbook-media")
        .return_mode(ReturnMode::InlineBinary)
        .build()
        .unwrap();
    let (pipeline, store) = memory_pipeline(config);

    let bytes = encode(&subject_image(90, 60), ImageFormat::Png);
    let outcome = pipeline
        .run(&CutoutRequest::new(ImageSource::Bytes(bytes)))
        .await
        .unwrap();

    match &outcome.references()[0] {
        Reference::Inline { png, copy } => {
            assert!(copy.is_none());
            let decoded = image::load_from_memory(png).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (90, 60));
        },
        other => panic!("expected inline reference, got {other:?}"),
    }
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn pass_through_stores_opaque_source() {
    let config = PipelineConfig::builder()
        .bucket("scrapbook-media")
        .return_mode(ReturnMode::S3Uri)
        .no_detection(NoDetectionPolicy::PassThrough)
        .build()
        .unwrap();
    let (pipeline, store) = memory_pipeline(config);

    let bytes = encode(&uniform_image(40, 30), ImageFormat::Png);
    let outcome = pipeline
        .run(&CutoutRequest::new(ImageSource::Bytes(bytes)))
        .await
        .unwrap();

    assert!(outcome.diagnostics().passed_through);
    assert_eq!(outcome.detected_count(), 0);
    let location = stored_location(&outcome.references()[0]);
    assert_eq!(
        outcome.references()[0].url(),
        Some(location.s3_uri().as_str())
    );

    let object = store.object(&location).await.unwrap();
    let png = image::load_from_memory(&object.bytes).unwrap().to_rgba8();
    assert!(png.pixels().all(|p| p.0[3] == 255));
}

#[tokio::test]
async fn explicit_key_with_all_scope_is_indexed() {
    let config = PipelineConfig::builder()
        .bucket("scrapbook-media")
        .return_mode(ReturnMode::S3Uri)
        .scope(CutoutScope::All)
        .build()
        .unwrap();
    let (pipeline, store) = memory_pipeline(config);

    let bytes = encode(&subject_image(60, 60), ImageFormat::Png);
    let request = CutoutRequest::new(ImageSource::Bytes(bytes)).with_target(
        museum_cutout::ObjectTarget {
            bucket: Some("exhibits".to_string()),
            key: Some("room-4/vase.png".to_string()),
        },
    );
    let outcome = pipeline.run(&request).await.unwrap();

    assert_eq!(
        outcome.references()[0].url(),
        Some("s3://exhibits/room-4/vase.png")
    );
    assert_eq!(store.write_count(), outcome.references().len());
}
