//! Model-serving gateway: hot-swappable model cache in front of a tracking store.

pub mod api;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod store;
pub mod train;

pub use cache::{ActiveModel, CacheError, CacheState, CacheStatus, ModelCache};
pub use config::GatewayConfig;
pub use engine::{classify, Classification, Classifier, FeatureVector, InferenceError, LogisticRegression, ModelHandle};
pub use store::{LocalStore, ModelReference, ModelSource, ModelStore, Stage, StoreError, VersionId};
