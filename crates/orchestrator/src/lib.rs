pub mod cycle;
pub mod jobs;
pub mod orchestrator;
pub mod scheduler;

pub use cycle::{
    CycleRunner, ForecastCycleReport, ObservationCycleReport, ObservationTally, SourceOutcome,
    Stores,
};
pub use jobs::{JobKind, JobRegistry, JobState, JobStatus};
pub use orchestrator::{CycleReport, Orchestrator};
pub use scheduler::CycleScheduler;
