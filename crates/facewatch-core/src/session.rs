//! ONNX Runtime session setup shared by the detector and the recognizer.

use ort::session::Session;
use std::path::Path;

/// Threads per session. Detection and embedding run back to back on one
/// engine thread, so a small pool is enough.
const INTRA_THREADS: usize = 2;

/// Open a CPU session for the model at `path`; `None` if the file is missing.
pub(crate) fn open_model(path: &str) -> Result<Option<Session>, ort::Error> {
    if !Path::new(path).is_file() {
        return Ok(None);
    }
    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(path)?;
    Ok(Some(session))
}
