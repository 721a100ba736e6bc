//! facewatch-core: face encoding and gallery matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on the CPU, and matches embeddings against a
//! named gallery by distance.

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod matcher;
pub mod recognizer;
mod session;
pub mod types;

use std::path::PathBuf;

pub use encoder::{EncodedFace, EncoderError, FaceEncoder, OnnxFaceEncoder};
pub use matcher::{DistanceMatcher, Gallery, GalleryEntry, MatchError, MatchResult, Matcher, Metric};
pub use recognizer::{arcface_matcher, ARCFACE_MATCH_SIMILARITY, ARCFACE_REFERENCE_TOLERANCE};
pub use types::{BoundingBox, Embedding};

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facewatch/models`, falling back
/// to `~/.local/share/facewatch/models`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("facewatch").join("models")
}
