use image::codecs::png::PngEncoder;
use image::{imageops, ExtendedColorType, ImageEncoder, RgbImage};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::common::Frame;
use crate::error::AnalysisError;
use crate::pipeline::domain::PlanktonResult;

/// Pixels kept around each region of interest when it is cropped out.
pub const ROI_PADDING: u32 = 10;

/// A file in the store and whether this call put it there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub path: PathBuf,
    pub created: bool,
}

/// Content-addressed PNG storage for analyzed frames.
///
/// A frame is written to `<sha256>.png`; identical frames share one file. Files are written
/// to a temporary name first and renamed into place, so a reader never sees a partial image.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save_frame(&self, frame: &Frame) -> Result<StoredImage, AnalysisError> {
        let name = format!("{}.png", frame.digest_hex());
        let image = frame.clone();
        self.save(name, false, move || encode_png(image.image())).await
    }

    /// Stores an overlay rendered from `frame` next to the frame itself, replacing any
    /// earlier overlay of the same frame.
    pub async fn save_annotated(&self, frame: &Frame, annotated: RgbImage) -> Result<StoredImage, AnalysisError> {
        let name = format!("{}_annotated.png", frame.digest_hex());
        self.save(name, true, move || encode_png(&annotated)).await
    }

    /// Crops the `limit` most confident plankton regions, padded by [`ROI_PADDING`], into
    /// `<sha256>_roi_<n>.png`. Regions that end up empty on this frame are skipped.
    pub async fn save_roi_crops(
        &self,
        frame: &Frame,
        plankton: &PlanktonResult,
        limit: usize,
    ) -> Result<Vec<StoredImage>, AnalysisError> {
        let mut ranked: Vec<_> = plankton.detailed.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let (width, height) = (frame.width(), frame.height());
        let mut stored = Vec::new();
        for detection in ranked.into_iter().take(limit) {
            let (x, y, w, h) = detection.roi_bbox.to_pixels(width, height);
            let x0 = x.saturating_sub(ROI_PADDING).min(width);
            let y0 = y.saturating_sub(ROI_PADDING).min(height);
            let x1 = (x + w + ROI_PADDING).min(width);
            let y1 = (y + h + ROI_PADDING).min(height);
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            let name = format!("{}_roi_{}.png", frame.digest_hex(), stored.len() + 1);
            let source = frame.clone();
            let image = self
                .save(name, true, move || {
                    encode_png(&imageops::crop_imm(source.image(), x0, y0, x1 - x0, y1 - y0).to_image())
                })
                .await?;
            stored.push(image);
        }
        Ok(stored)
    }

    async fn save<F>(&self, name: String, replace: bool, encode: F) -> Result<StoredImage, AnalysisError>
    where
        F: FnOnce() -> Result<Vec<u8>, image::ImageError> + Send + 'static,
    {
        let path = self.dir.join(&name);
        let existed = tokio::fs::try_exists(&path).await?;
        if existed && !replace {
            tracing::debug!(path = %path.display(), "Image already stored");
            return Ok(StoredImage { path, created: false });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = tokio::task::spawn_blocking(encode)
            .await
            .map_err(io::Error::other)??;

        let tmp = self.dir.join(format!(".{name}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Image stored");
        Ok(StoredImage { path, created: !existed })
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buffer)
}
