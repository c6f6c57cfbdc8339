use crate::service::ClassifyService;
use crate::store::StoreError;
use animal_core::GenderHint;
use zbus::interface;

pub const BUS_NAME: &str = "org.animalface.Classifier1";
pub const OBJECT_PATH: &str = "/org/animalface/Classifier1";

/// D-Bus interface for the animal-face classifier daemon.
///
/// Bus name: org.animalface.Classifier1
/// Object path: /org/animalface/Classifier1
pub struct AnimalService {
    pub service: ClassifyService,
}

#[interface(name = "org.animalface.Classifier1")]
impl AnimalService {
    /// Classify an encoded image. `gender` is "male", "female" or empty.
    /// Returns the upload envelope as JSON; failures are reported in-band.
    async fn classify(&self, image: Vec<u8>, gender: &str) -> zbus::fdo::Result<String> {
        let gender = GenderHint::parse(gender);
        tracing::info!(bytes = image.len(), ?gender, "classify requested");
        let response = self.service.classify(image, gender).await;
        serde_json::to_string(&response).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Fetch a persisted result by id.
    async fn get_result(&self, id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, "get_result requested");
        match self.service.get_result(id).await {
            Ok(stored) => serde_json::to_string(&stored).map_err(|e| zbus::fdo::Error::Failed(e.to_string())),
            Err(e @ StoreError::InvalidId(_)) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
            Err(e @ StoreError::NotFound(_)) => Err(zbus::fdo::Error::FileNotFound(e.to_string())),
            Err(e) => {
                tracing::error!(id, error = %e, "failed to load result");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.service.status().to_string())
    }
}
