pub mod topology;
pub mod ml_model;
pub mod weights;
pub mod preprocess;
pub mod reconstruct;
pub mod inference;

pub use topology::{ModelPlan, Topology, TopologyError};
pub use ml_model::XrayClassifier;
pub use weights::{load_weights, WeightsError};
pub use preprocess::{image_to_input, InputTensor};
pub use reconstruct::{reconstruct_model, ReconstructError, ReconstructOutcome};
pub use inference::{load_classifier, Classifier, ClassifyError, InferenceEngine};
