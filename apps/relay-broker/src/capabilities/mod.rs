//! Concrete capabilities a broker can host, one per service kind.

pub mod memory;
pub mod transcript;
pub mod watch;

pub use memory::{MemoryTopic, RobotMemory};
pub use transcript::{TranscriptAnalysis, TranscriptTopic, SENTIMENT_TOPIC};
pub use watch::{Watch, WatchLabel, WatchTopic};
