pub mod error;
pub mod orchestrator;
pub mod persist;
pub mod poller;
pub mod provider;
pub mod session;
pub mod submission;
pub mod tags;
pub mod task;

pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{GenerationInput, Orchestrator};
pub use persist::{ActiveSession, PersistConfig};
pub use poller::{PollConfig, PollSummary, PollingEngine};
pub use provider::{
    ArtifactFetcher, ArtifactSink, DownstreamClient, FileType, GenerationProvider,
    GenerationRequest, JobState, JobStatus, LocalArtifactSink, PreSubmitRequest, StoredArtifact,
    TagEncoding,
};
pub use session::{MemorySessionStore, Session, SessionPatch, SessionStore};
pub use submission::{RetryPolicy, SubmissionOutcome, SubmissionPipeline, SubmissionReport};
pub use tags::{Tag, TagSet};
pub use task::{TaskStatus, VideoTask};
