//! Face encoding capability: image in, one (box, embedding) pair per face out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ImageError, RgbImage};
use thiserror::Error;

/// JPEG quality used for stored face crops.
const CROP_JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("unreadable image: {0}")]
    Decode(#[from] ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One detected face and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFace {
    pub bbox: BoundingBox,
    pub encoding: Embedding,
}

/// Detects faces in a decoded image and embeds each of them.
///
/// Implementations run on a dedicated thread and may keep mutable model
/// state, hence `&mut self`. Output order is implementation-defined and
/// carries no identity continuity between calls.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFace>, EncoderError>;
}

/// SCRFD detection followed by ArcFace embedding, both on ONNX Runtime.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<EncodedFace>, EncoderError> {
        let boxes = self.detector.detect(image)?;
        boxes
            .into_iter()
            .map(|bbox| {
                let encoding = self.recognizer.extract(image, &bbox)?;
                Ok(EncodedFace { bbox, encoding })
            })
            .collect()
    }
}

/// Decode uploaded bytes (any format the `image` crate understands) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EncoderError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Cut the bounding box out of `image`, clamped to its bounds.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.pixel_rect(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, EncoderError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, CROP_JPEG_QUALITY).encode_image(image)?;
    Ok(buf)
}
