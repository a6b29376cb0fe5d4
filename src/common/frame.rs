use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Where a frame came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameOrigin {
    Camera { device: String },
    Upload { file_name: String },
}

/// An immutable RGB8 image plus capture metadata. Clones share the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    frame_id: Uuid,
    origin: FrameOrigin,
    image: Arc<RgbImage>,
    captured_at: DateTime<Utc>,
    digest: Arc<OnceLock<[u8; 32]>>,
}

impl Frame {
    pub fn new(origin: FrameOrigin, image: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            frame_id: Uuid::new_v4(),
            origin,
            image: Arc::new(image),
            captured_at,
            digest: Arc::new(OnceLock::new()),
        }
    }

    /// Decodes an uploaded image file. Any format the `image` crate recognises is accepted
    /// and converted to RGB8.
    pub fn from_upload(bytes: &[u8], file_name: impl Into<String>) -> Result<Self, image::ImageError> {
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self::new(
            FrameOrigin::Upload {
                file_name: file_name.into(),
            },
            decoded.to_rgb8(),
            Utc::now(),
        ))
    }

    pub fn id(&self) -> Uuid {
        self.frame_id
    }

    pub fn origin(&self) -> &FrameOrigin {
        &self.origin
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// SHA-256 over the dimensions and raw pixels, computed once per buffer.
    pub fn digest(&self) -> [u8; 32] {
        *self.digest.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.image.width().to_le_bytes());
            hasher.update(self.image.height().to_le_bytes());
            hasher.update(self.image.as_raw());
            hasher.finalize().into()
        })
    }

    pub fn digest_hex(&self) -> String {
        to_hex(&self.digest())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("origin", &self.origin)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn cloning_frame_shares_image_buffer() {
        let origin = FrameOrigin::Camera {
            device: "usb:0".to_string(),
        };
        let f1 = Frame::new(origin, solid(16, 16, [1, 2, 3]), Utc::now());
        let f2 = f1.clone();
        assert!(Arc::ptr_eq(&f1.image, &f2.image));
        assert_eq!(f1.id(), f2.id());
    }

    #[test]
    fn digest_depends_on_pixels_and_dimensions() {
        let origin = FrameOrigin::Camera {
            device: "usb:0".to_string(),
        };
        let a = Frame::new(origin.clone(), solid(8, 4, [9, 9, 9]), Utc::now());
        let b = Frame::new(origin.clone(), solid(8, 4, [9, 9, 9]), Utc::now());
        let c = Frame::new(origin.clone(), solid(4, 8, [9, 9, 9]), Utc::now());
        let d = Frame::new(origin, solid(8, 4, [9, 9, 8]), Utc::now());

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_ne!(a.digest(), d.digest());
        assert_eq!(a.digest_hex().len(), 64);
    }

    #[test]
    fn upload_is_decoded_to_rgb() {
        let mut encoded = Vec::new();
        image::DynamicImage::ImageRgb8(solid(32, 20, [10, 200, 30]))
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .unwrap();

        let frame = Frame::from_upload(&encoded, "slide.png").unwrap();
        assert_eq!((frame.width(), frame.height()), (32, 20));
        assert_eq!(frame.image().get_pixel(3, 3), &Rgb([10, 200, 30]));
        assert_eq!(
            frame.origin(),
            &FrameOrigin::Upload {
                file_name: "slide.png".to_string()
            }
        );
    }

    #[test]
    fn garbage_upload_is_rejected() {
        assert!(Frame::from_upload(b"not an image", "junk.bin").is_err());
    }
}
