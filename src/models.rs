use serde::{Deserialize, Serialize};

/// A flight-confirmation email saved during the label phase.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailRecord {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub msg_date: Option<String>,
    pub pnr: Option<String>,
    pub flight_number: Option<String>,
    pub departure_airport: Option<String>,
    pub arrival_airport: Option<String>,
}

/// Outcome of one attempt to push a message through a phase.
/// Events are append-only; a message counts as done for a phase
/// once any Success event exists for that (message, phase) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Success => "SUCCESS",
            ProcessingStatus::Failed => "FAILED",
            ProcessingStatus::Skipped => "SKIPPED",
        }
    }
}

/// One row of the `--stats` summary.
#[derive(Debug, Clone)]
pub struct PhaseStat {
    pub phase: String,
    pub status: String,
    pub count: i64,
}

/// Coarse per-run marker for external audit. Resumability does not
/// depend on these; it comes from the processing_events ledger.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: i64,
    pub last_message_id: Option<String>,
    pub last_sync_time: Option<chrono::NaiveDateTime>,
    pub status: Option<String>,
    pub failed_message_ids: Vec<String>,
    pub note: Option<String>,
}

/// A fully fetched message, ready for classification and parsing.
#[derive(Debug, Clone, Default)]
pub struct EmailContent {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from_address: String,
    pub msg_date: String,
    pub html_body: String,
    pub text_body: String,
}

/// Structured fields pulled out of a confirmation email. Fields the
/// extractor could not find stay None; they are never guessed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlightDetails {
    pub booking_reference: Option<String>,
    pub flight_number: Option<String>,
    pub departure_airport: Option<String>,
    pub arrival_airport: Option<String>,
    pub departure_time: Option<String>,
    pub arrival_time: Option<String>,
}

impl FlightDetails {
    pub fn is_empty(&self) -> bool {
        self.booking_reference.is_none()
            && self.flight_number.is_none()
            && self.departure_airport.is_none()
            && self.arrival_airport.is_none()
            && self.departure_time.is_none()
            && self.arrival_time.is_none()
    }
}
