use facewatch_core::encoder::{crop_face, decode_image, encode_jpeg};
use facewatch_core::{BoundingBox, Embedding, EncoderError, FaceEncoder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("detection timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One face found in an upload.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub encoding: Embedding,
    /// JPEG of the face region; `None` if the box fell outside the image.
    pub crop: Option<Vec<u8>>,
}

/// Messages sent from request handlers to the engine thread.
struct DetectRequest {
    image: Arc<[u8]>,
    reply: oneshot::Sender<Result<Vec<DetectedFace>, EngineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<DetectRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Decode `image`, find every face and embed it.
    ///
    /// Queueing and inference together are bounded by the engine timeout.
    pub async fn detect(&self, image: Arc<[u8]>) -> Result<Vec<DetectedFace>, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(DetectRequest { image, reply: reply_tx })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
        };
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
    }

    /// Whether the engine thread is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The encoder is moved onto the thread and driven from a request loop;
/// inference never runs on the async runtime.
pub fn spawn_engine(mut encoder: Box<dyn FaceEncoder>, timeout: Duration) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(4);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_detect(encoder.as_mut(), &req.image);
                // The caller may have timed out and dropped the receiver.
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, timeout })
}

fn run_detect(encoder: &mut dyn FaceEncoder, bytes: &[u8]) -> Result<Vec<DetectedFace>, EngineError> {
    let started = Instant::now();
    let image = decode_image(bytes)?;
    let faces = encoder.encode(&image)?;

    let detected: Vec<DetectedFace> = faces
        .into_iter()
        .map(|face| {
            let crop = crop_face(&image, &face.bbox).and_then(|crop| match encode_jpeg(&crop) {
                Ok(jpeg) => Some(jpeg),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode face crop");
                    None
                }
            });
            DetectedFace {
                bbox: face.bbox,
                encoding: face.encoding,
                crop,
            }
        })
        .collect();

    tracing::debug!(
        width = image.width(),
        height = image.height(),
        faces = detected.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "detect: done"
    );
    Ok(detected)
}
