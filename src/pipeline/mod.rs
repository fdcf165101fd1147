//! The replication pipeline: envelopes, durable topics, stage framework.

pub mod envelope;
pub mod queue;
pub mod stage;

pub use envelope::{
    CopyResult, PackageResult, RecordResult, ResultEnvelope, StageTag, StoreResult,
    ValidateResult,
};
pub use queue::{DirQueue, Message};
pub use stage::{Stage, StageOutcome, StageRunner};

/// Topic names, one per stage.
pub const TOPIC_PACKAGE: &str = "package";
pub const TOPIC_COPY: &str = "copy";
pub const TOPIC_VALIDATE: &str = "validate";
pub const TOPIC_STORE: &str = "store";
pub const TOPIC_RECORD: &str = "record";
pub const TOPIC_TROUBLE: &str = "trouble";
