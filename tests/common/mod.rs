//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use museum_cutout::{
    BlobStore, CutoutPipeline, Mask, MaskSignal, MemoryStore, PipelineConfig, Result,
    Segmenter, SegmenterKind, SourceImage,
};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Detector stand-in: everything that differs from the border color is the subject
///
/// Emits a single mask with measured area and fixed confidence, or nothing for
/// uniform images.
#[derive(Debug, Clone)]
pub struct ContrastSegmenter {
    /// Minimum per-channel difference from the border mean
    pub threshold: f32,
    pub confidence: f32,
}

impl Default for ContrastSegmenter {
    fn default() -> Self {
        Self {
            threshold: 40.0,
            confidence: 0.9,
        }
    }
}

fn border_mean(image: &RgbImage) -> [f32; 3] {
    let (w, h) = image.dimensions();
    let mut sum = [0.0f32; 3];
    let mut count = 0.0f32;
    for (x, y, pixel) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            for c in 0..3 {
                sum[c] += f32::from(pixel.0[c]);
            }
            count += 1.0;
        }
    }
    sum.map(|s| s / count)
}

#[async_trait]
impl Segmenter for ContrastSegmenter {
    async fn segment(&self, image: &SourceImage, _config: &PipelineConfig) -> Result<Vec<Mask>> {
        let rgb = image.rgb();
        let background = border_mean(rgb);
        let mask = Mask::from_fn(rgb.width(), rgb.height(), |x, y| {
            let pixel = rgb.get_pixel(x, y).0;
            let differs =
                (0..3).any(|c| (f32::from(pixel[c]) - background[c]).abs() > self.threshold);
            if differs {
                1.0
            } else {
                0.0
            }
        });
        if mask.coverage(0.5) == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![mask
            .with_measured_area(image.dimensions())
            .with_confidence(self.confidence)])
    }

    fn kind(&self) -> SegmenterKind {
        SegmenterKind::Detection
    }

    fn natural_signal(&self) -> MaskSignal {
        MaskSignal::AreaAndConfidence
    }
}

/// Light background with a dark centered rectangle covering the middle third
pub fn subject_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let inside = x >= width / 3 && x < 2 * width / 3 && y >= height / 3 && y < 2 * height / 3;
        if inside {
            Rgb([40, 30, 20])
        } else {
            Rgb([235, 235, 230])
        }
    })
}

pub fn uniform_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

pub fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut out), format)
        .unwrap();
    out
}

/// Route `log` output to the test harness, `RUST_LOG` selects the level
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

pub fn config() -> PipelineConfig {
    init_logging();
    PipelineConfig::builder()
        .bucket("scrapbook-media")
        .fetch_timeout_secs(5)
        .build()
        .unwrap()
}

pub fn pipeline_with(
    config: PipelineConfig,
    store: Arc<dyn BlobStore>,
) -> CutoutPipeline {
    CutoutPipeline::new(config, Arc::new(ContrastSegmenter::default()), Some(store)).unwrap()
}

pub fn memory_pipeline(config: PipelineConfig) -> (CutoutPipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (pipeline_with(config, store.clone()), store)
}

/// Minimal HTTP/1.1 server answering every request with the same response
pub async fn serve(status: u16, content_type: &str, body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let content_type = content_type.to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            let content_type = content_type.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 {status} Test\r\n\
                     Content-Type: {content_type}\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
