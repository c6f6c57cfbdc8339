//! Inference engine: a fixed set of worker threads, each owning one
//! pipeline (detector + oracle sessions), fed from a bounded queue.
//!
//! A worker runs a request to completion even if the caller has given up;
//! the reply is simply dropped.

use animal_core::detector::FaceDetect;
use animal_core::oracle::ScoreOracle;
use animal_core::{Classification, Classifier, ClassifyError, GenderHint};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error("engine needs at least one worker")]
    NoWorkers,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out after {0:?} waiting for a result")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A pipeline a worker thread can own and drive.
pub trait Worker: Send + 'static {
    fn classify(&mut self, image: &[u8], gender: GenderHint) -> Result<Classification, ClassifyError>;
}

impl<D, O> Worker for Classifier<D, O>
where
    D: FaceDetect + Send + 'static,
    O: ScoreOracle + Send + 'static,
{
    fn classify(&mut self, image: &[u8], gender: GenderHint) -> Result<Classification, ClassifyError> {
        Classifier::classify(self, image, gender)
    }
}

/// Messages sent from request handlers to the worker threads.
enum EngineRequest {
    Classify {
        id: u64,
        image: Vec<u8>,
        gender: GenderHint,
        reply: oneshot::Sender<Result<Classification, ClassifyError>>,
    },
}

/// Clone-safe handle to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Option<Duration>,
    next_id: Arc<AtomicU64>,
}

impl EngineHandle {
    /// Queue an image and wait for its classification. The timeout covers
    /// both waiting for a queue slot and waiting for the result.
    pub async fn classify(&self, image: Vec<u8>, gender: GenderHint) -> Result<Classification, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(EngineRequest::Classify {
                    id,
                    image,
                    gender,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.map_err(|_| {
                tracing::warn!(request = id, ?limit, "caller gave up waiting");
                EngineError::Timeout(limit)
            })??,
            None => request.await?,
        };
        Ok(reply?)
    }
}

/// Spawn one OS thread per worker. Workers share the request queue.
pub fn spawn_engine<W: Worker>(
    workers: Vec<W>,
    queue_depth: usize,
    timeout: Option<Duration>,
) -> Result<EngineHandle, EngineError> {
    if workers.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));
    let count = workers.len();

    for (n, mut worker) in workers.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("animal-worker-{n}"))
            .spawn(move || {
                tracing::info!(worker = n, "worker thread started");
                loop {
                    let next = match rx.lock() {
                        Ok(mut guard) => guard.blocking_recv(),
                        Err(_) => break,
                    };
                    let Some(req) = next else { break };
                    match req {
                        EngineRequest::Classify { id, image, gender, reply } => {
                            let started = std::time::Instant::now();
                            let result = worker.classify(&image, gender);
                            tracing::debug!(
                                worker = n,
                                request = id,
                                ok = result.is_ok(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "request done"
                            );
                            if reply.send(result).is_err() {
                                tracing::debug!(request = id, "caller gone; result dropped");
                            }
                        }
                    }
                }
                tracing::info!(worker = n, "worker thread exiting");
            })?;
    }

    tracing::info!(workers = count, queue_depth, "engine started");

    Ok(EngineHandle {
        tx,
        timeout,
        next_id: Arc::new(AtomicU64::new(1)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use animal_core::{Animal, LabelScore};
    use std::sync::atomic::AtomicUsize;

    struct EchoWorker {
        delay: Duration,
        done: Arc<AtomicUsize>,
    }

    impl Worker for EchoWorker {
        fn classify(&mut self, image: &[u8], gender: GenderHint) -> Result<Classification, ClassifyError> {
            std::thread::sleep(self.delay);
            self.done.fetch_add(1, Ordering::SeqCst);
            match (image.first(), gender) {
                (None, _) => Err(ClassifyError::NoFaceDetected),
                (_, GenderHint::Male) => Err(ClassifyError::EmptyCandidateSet),
                _ => Ok(Classification {
                    labels: vec![LabelScore { label: Animal::Dog, percentage: 100.0 }],
                }),
            }
        }
    }

    fn workers(n: usize, delay: Duration) -> (Vec<EchoWorker>, Arc<AtomicUsize>) {
        let done = Arc::new(AtomicUsize::new(0));
        let ws = (0..n).map(|_| EchoWorker { delay, done: done.clone() }).collect();
        (ws, done)
    }

    #[test]
    fn test_spawn_requires_workers() {
        let err = spawn_engine(Vec::<EchoWorker>::new(), 4, None).err().unwrap();
        assert!(matches!(err, EngineError::NoWorkers));
    }

    #[tokio::test]
    async fn test_classify_roundtrip() {
        let (ws, _) = workers(1, Duration::ZERO);
        let engine = spawn_engine(ws, 4, None).unwrap();
        let result = engine.classify(vec![1, 2, 3], GenderHint::None).await.unwrap();
        assert_eq!(result.labels[0].label, Animal::Dog);
    }

    #[tokio::test]
    async fn test_errors_are_passed_through() {
        let (ws, _) = workers(1, Duration::ZERO);
        let engine = spawn_engine(ws, 4, None).unwrap();
        let err = engine.classify(vec![], GenderHint::None).await.unwrap_err();
        assert!(matches!(err, EngineError::Classify(ClassifyError::NoFaceDetected)));
        let err = engine.classify(vec![1], GenderHint::Male).await.unwrap_err();
        assert!(matches!(err, EngineError::Classify(ClassifyError::EmptyCandidateSet)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_across_workers() {
        let (ws, done) = workers(3, Duration::from_millis(20));
        let engine = spawn_engine(ws, 8, None).unwrap();
        let tasks: Vec<_> = (0..9)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.classify(vec![7], GenderHint::None).await })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        assert_eq!(done.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_timeout_lets_worker_finish() {
        let (ws, done) = workers(1, Duration::from_millis(200));
        let engine = spawn_engine(ws, 4, Some(Duration::from_millis(20))).unwrap();
        let err = engine.classify(vec![1], GenderHint::None).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_covers_full_queue() {
        let (ws, _) = workers(1, Duration::from_millis(400));
        let engine = spawn_engine(ws, 1, Some(Duration::from_millis(50))).unwrap();

        // First request occupies the worker, second fills the only slot.
        let busy = engine.clone();
        tokio::spawn(async move { busy.classify(vec![1], GenderHint::None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = engine.clone();
        tokio::spawn(async move { queued.classify(vec![2], GenderHint::None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        let err = engine.classify(vec![3], GenderHint::None).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
