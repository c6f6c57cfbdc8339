//! Request handling behind the D-Bus surface: run the engine, build the
//! envelope and persist successful results.

use crate::engine::{EngineError, EngineHandle};
use crate::response::UploadResponse;
use crate::store::{ResultStore, StoreError, StoredResult};
use animal_core::settings::OracleKind;
use animal_core::GenderHint;
use uuid::Uuid;

pub struct ClassifyService {
    engine: EngineHandle,
    store: ResultStore,
    oracle: OracleKind,
    workers: usize,
}

impl ClassifyService {
    pub fn new(engine: EngineHandle, store: ResultStore, oracle: OracleKind, workers: usize) -> Self {
        Self { engine, store, oracle, workers }
    }

    pub async fn classify(&self, image: Vec<u8>, gender: GenderHint) -> UploadResponse {
        let size = image.len();
        match self.engine.classify(image, gender).await {
            Ok(result) => {
                let id = Uuid::new_v4().to_string();
                let response = UploadResponse::success(id, &result);
                if let Err(e) = self.store.save(&response, gender).await {
                    tracing::error!(error = %e, "failed to persist result");
                    return UploadResponse::unknown(format!("error: {e}"));
                }
                tracing::info!(
                    id = response.id.as_deref().unwrap_or_default(),
                    animal = %response.main_result.animal,
                    score = response.main_result.score,
                    "classified"
                );
                response
            }
            Err(EngineError::Classify(e)) => {
                if e.is_user_correctable() {
                    tracing::info!(size, error = %e, "rejected upload");
                } else {
                    tracing::warn!(size, ?gender, error = %e, "classification failed");
                }
                UploadResponse::failure(&e)
            }
            Err(e) => {
                tracing::error!(size, error = %e, "engine error");
                UploadResponse::unknown(format!("error: {e}"))
            }
        }
    }

    pub async fn get_result(&self, id: &str) -> Result<StoredResult, StoreError> {
        self.store.load(id).await
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "oracle": self.oracle.to_string(),
            "workers": self.workers,
            "results_dir": self.store.dir().display().to_string(),
        })
    }
}
