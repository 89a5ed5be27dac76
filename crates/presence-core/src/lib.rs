//! presence-core: Face matching and attendance engine.
//!
//! Turns detected face regions into intensity-histogram descriptors, matches
//! them against a registry of enrolled identities, debounces repeat sightings
//! and drives the per-day attendance state machine over a ledger.

pub mod attendance;
pub mod clock;
pub mod cooldown;
pub mod detector;
pub mod enroll;
pub mod features;
pub mod registry;
#[cfg(feature = "scrfd")]
pub mod scrfd;
pub mod types;

pub use attendance::{
    AttendanceDayRecord, AttendanceOutcome, AttendanceStateMachine, DayStatus, Ledger, LedgerError,
    MemoryLedger, RecordQuery, TransitionError,
};
pub use clock::{Clock, SystemClock};
pub use cooldown::CooldownGate;
pub use detector::{FaceDetector, FullFrameDetector};
pub use features::FeatureExtractor;
pub use registry::{TemplateRegistry, Upsert};
pub use types::{CorrelationMatcher, Descriptor, MatchResult, Matcher, Region, UNKNOWN_IDENTITY};
