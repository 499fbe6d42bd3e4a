use facereg_core::{
    EmbeddingExtractor, EmbeddingMatcher, FaceDetector, FaceError, LoadError, Recognition,
    RecognitionService, RecordStore, Registration,
};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Face(#[from] FaceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, FaceError>>;

/// Messages sent from callers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        images: Vec<Result<RgbImage, LoadError>>,
        reply: Reply<Registration>,
    },
    Recognize {
        frame: RgbImage,
        reply: Reply<Recognition>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    matcher: Arc<EmbeddingMatcher>,
}

impl EngineHandle {
    /// Register a person from a set of photos. Photos that failed to load
    /// still count as submitted.
    pub async fn register(
        &self,
        name: String,
        images: Vec<Result<RgbImage, LoadError>>,
    ) -> Result<Registration, EngineError> {
        self.call(|reply| EngineRequest::Register { name, images, reply })
            .await
    }

    /// Identify every face in a frame.
    pub async fn recognize(&self, frame: RgbImage) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize { frame, reply })
            .await
    }

    /// Embeddings currently in the gallery, read without queueing behind
    /// in-flight requests.
    pub fn gallery_size(&self) -> usize {
        self.matcher.len()
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Move the recognition service onto a dedicated OS thread.
///
/// The ONNX sessions need exclusive access, so requests are queued and
/// served one at a time. The thread exits once every handle is dropped.
pub fn spawn_engine<D, E, S>(
    mut service: RecognitionService<D, E, S>,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
    S: RecordStore + Send + 'static,
{
    let matcher = service.matcher();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facereg-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register {
                        name,
                        images,
                        reply,
                    } => {
                        let _ = reply.send(service.register_person(&name, images));
                    }
                    EngineRequest::Recognize { frame, reply } => {
                        let _ = reply.send(service.recognize(&frame));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, matcher })
}
