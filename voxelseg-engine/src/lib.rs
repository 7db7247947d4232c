//! Interactive segmentation session engine: voxelization, click handling,
//! inference orchestration, artifact persistence and object recognition.

pub mod artifacts;
pub mod clicks;
pub mod gateway;
pub mod orchestrator;
pub mod ply;
pub mod recognition;
pub mod session;
pub mod voxel;

pub use artifacts::{ArtifactManager, CleanupHandle, RoundArtifacts, ZipStream};
pub use clicks::{Click, ClickLedger, ObjectClicks, BACKGROUND_KEY};
pub use gateway::{
    ClassScores, ModelGateway, ModelRequest, RecognitionBackend, RecognitionOutcome,
    RemoteModelGateway, RemoteRecognitionBackend,
};
pub use orchestrator::InferenceOrchestrator;
pub use ply::{AsciiPlyCodec, GeometryCodec, Scene};
pub use recognition::{RecognitionDispatcher, RecognitionResult};
pub use session::{
    ClickSpec, RecognitionReport, SessionState, SessionStore, UploadSummary,
};
pub use voxel::{VoxelMap, VoxelMapper};
