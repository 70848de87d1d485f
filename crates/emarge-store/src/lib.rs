//! emarge-store — Persistence for the attendance pipeline.
//!
//! Two stores live here: the filesystem sample store feeding recognizer
//! training, and the SQLite attendance ledger holding the per-day
//! clock-in/clock-out state machine.

pub mod ledger;
pub mod samples;
mod schema;

pub use ledger::{AttendanceLedger, AttendanceRecord, AttendanceState, LedgerError};
pub use samples::{EnrollmentGuard, SampleId, SampleStore, SampleStoreError};
