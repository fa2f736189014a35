pub mod model_metadata;
pub mod model_storage;
pub mod inference_config;
pub mod config;

pub use model_metadata::ArtifactMetadata;
pub use model_storage::{save_artifact, load_metadata, load_model_binary, load_artifact, log_metadata_info};
pub use inference_config::InferenceConfig;
pub use config::{AppConfig, DeviceType, ModelSettings, ServerSettings, UploadSettings, LedgerSettings};
