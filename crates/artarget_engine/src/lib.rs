//! AR target engine: IO pipeline and effect execution.
mod compute;
mod engine;
mod executor;
mod filename;
mod http;
mod network;
mod reconcile;
mod settings;
mod store;
mod token;
mod types;
mod upload;
mod validate;

pub use compute::{
    BlockingCompute, CommandCompute, ComputeLoader, ComputeModule, ExtractControl,
    FeatureExtractor, ModuleCache, PreloadedModule,
};
pub use engine::{CompileEngine, EngineParts};
pub use executor::NetworkAwareExecutor;
pub use filename::{artifact_object_path, ARTIFACT_EXTENSION};
pub use http::strip_query;
pub use network::{
    ConnectionInfo, ConnectivityProbe, EffectiveType, HttpConnectivityProbe, NetworkMonitor,
    NetworkStatus,
};
pub use reconcile::{
    HttpCompileApi, KickoffOutcome, Reconciled, RemoteCompileApi, RemoteStatus, StatusReconciler,
    ALREADY_PROCESSING,
};
pub use settings::{
    EngineSettings, Endpoints, ExecutorSettings, NetworkSettings, ReconcileSettings,
    RetrySettings, UploadSettings, ValidationSettings,
};
pub use store::{
    ByteProgress, HttpMetadataStore, HttpObjectStore, InMemoryMetadataStore, JobMetadataStore,
    ObjectStore, ProcessingStatus, StatusRecord,
};
pub use token::{AbortCause, CancellationTokenManager, OperationToken, TokenOptions};
pub use types::{EngineEvent, IgnoreProgress, ProgressSink, SharedProgress, SourceImage};
pub use upload::{
    upload_token_id, UploadFile, UploadOptions, UploadPipeline, UploadStatus, UploadTask,
};
pub use validate::{validate_image, ImageInfo, ValidationError};
