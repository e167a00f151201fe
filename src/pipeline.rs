use crate::classify::FlightClassifier;
use crate::config::Config;
use crate::db::Database;
use crate::dedup::Deduplicator;
use crate::gmail::Mailbox;
use crate::models::{EmailContent, EmailRecord, ProcessingStatus};
use crate::parse::FlightParser;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error, info};

pub const PHASE_LABEL: &str = "label";
pub const PHASE_FORWARD: &str = "forward";

#[derive(Debug, Default)]
pub struct PhaseSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
}

/// Drives messages through the two-phase state machine. Each phase
/// consults the event ledger before touching a message, so interrupted
/// runs resume where they left off. In dry-run mode the bookkeeping
/// still happens but the mailbox is never mutated.
pub struct Pipeline<M> {
    gmail: M,
    db: Database,
    config: Config,
    dry_run: bool,
    classifier: FlightClassifier,
    parser: FlightParser,
}

impl<M: Mailbox> Pipeline<M> {
    pub fn new(gmail: M, db: Database, config: Config, dry_run: bool) -> Self {
        Self {
            gmail,
            db,
            config,
            dry_run,
            classifier: FlightClassifier::new(),
            parser: FlightParser::new(),
        }
    }

    /// Phase 1: search, classify, parse, and label flight emails.
    pub async fn run_label_phase(&self, query: &str, label_name: &str) -> Result<PhaseSummary> {
        info!("phase 1: labeling flight confirmation emails");

        let candidates = self.gmail.search_messages(query).await?;
        if candidates.is_empty() {
            info!("no messages match the query");
            return Ok(PhaseSummary::default());
        }
        info!("{} candidate messages", candidates.len());

        let mut summary = PhaseSummary::default();
        let mut to_label: Vec<String> = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            if self.db.is_processed(&candidate.id, PHASE_LABEL).await? {
                debug!(
                    "message {} (thread {}) already processed, skipping",
                    candidate.id,
                    candidate.thread_id.as_deref().unwrap_or("-")
                );
                continue;
            }

            if (i + 1) % 100 == 0 {
                info!("processing message {}/{}", i + 1, candidates.len());
            }

            summary.processed += 1;
            match self.identify_message(&candidate.id).await {
                Ok(true) => {
                    to_label.push(candidate.id.clone());
                    summary.succeeded += 1;
                    self.db
                        .mark_processed(&candidate.id, PHASE_LABEL, ProcessingStatus::Success, None)
                        .await?;
                }
                Ok(false) => {
                    summary.skipped += 1;
                    self.db
                        .mark_processed(&candidate.id, PHASE_LABEL, ProcessingStatus::Skipped, None)
                        .await?;
                }
                Err(err) => {
                    error!("error processing message {}: {:#}", candidate.id, err);
                    summary.failed.push(candidate.id.clone());
                    self.db
                        .mark_processed(
                            &candidate.id,
                            PHASE_LABEL,
                            ProcessingStatus::Failed,
                            Some(&format!("{:#}", err)),
                        )
                        .await?;
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.message_delay_ms)).await;
        }

        info!("identified {} flight confirmation emails", to_label.len());

        if !to_label.is_empty() {
            if self.dry_run {
                info!(
                    "[dry-run] would apply label '{}' to {} messages",
                    label_name,
                    to_label.len()
                );
            } else {
                let label_id = self.gmail.ensure_label(label_name).await?;
                self.gmail
                    .apply_label(&to_label, &label_id, self.config.label_batch_size)
                    .await?;
            }
        }

        self.checkpoint_phase(PHASE_LABEL, to_label.last(), &summary).await?;
        info!("phase 1 complete");
        Ok(summary)
    }

    /// Fetch, classify, and on a hit parse and persist. Returns whether
    /// the message was identified as a flight confirmation.
    async fn identify_message(&self, id: &str) -> Result<bool> {
        let email = self.gmail.get_message(id).await?;

        let verdict = self.classifier.classify(&email);
        if !verdict.is_flight {
            debug!("not a flight confirmation (score {}): {:.60}", verdict.score, email.subject);
            return Ok(false);
        }

        info!(
            "flight confirmation detected (score {}): {:.60}",
            verdict.score, email.subject
        );

        let details = self.parser.parse(&email);
        if let Some(details) = &details {
            info!(
                "parsed: pnr={}, flight={}",
                details.booking_reference.as_deref().unwrap_or("n/a"),
                details.flight_number.as_deref().unwrap_or("n/a"),
            );
        }

        self.db.upsert_email(&to_record(&email, details)).await?;
        Ok(true)
    }

    /// Phase 2: forward labeled-but-unforwarded emails downstream.
    pub async fn run_forward_phase(&self, deduplicate: bool) -> Result<PhaseSummary> {
        info!("phase 2: forwarding emails to {}", self.config.forward_to);

        let pending = self.db.get_unprocessed(PHASE_FORWARD).await?;
        if pending.is_empty() {
            info!("no emails to forward");
            return Ok(PhaseSummary::default());
        }
        info!("{} emails pending forward", pending.len());

        let survivors = if deduplicate {
            let dedup = Deduplicator::new(self.config.fuzzy_threshold);
            dedup.unique(pending)
        } else {
            pending
        };

        let mut summary = PhaseSummary::default();
        let mut last_id = None;

        for (i, email) in survivors.iter().enumerate() {
            summary.processed += 1;
            let outcome = if self.dry_run {
                info!(
                    "[dry-run] would forward message {} to {}",
                    email.message_id, self.config.forward_to
                );
                Ok("dry-run-message-id".to_string())
            } else {
                self.gmail
                    .forward_message(&email.message_id, &self.config.forward_to)
                    .await
            };
            match outcome {
                Ok(_) => {
                    summary.succeeded += 1;
                    self.db
                        .mark_processed(
                            &email.message_id,
                            PHASE_FORWARD,
                            ProcessingStatus::Success,
                            None,
                        )
                        .await?;
                }
                Err(err) => {
                    error!("failed to forward {}: {:#}", email.message_id, err);
                    summary.failed.push(email.message_id.clone());
                    self.db
                        .mark_processed(
                            &email.message_id,
                            PHASE_FORWARD,
                            ProcessingStatus::Failed,
                            Some(&format!("{:#}", err)),
                        )
                        .await?;
                }
            }
            last_id = Some(email.message_id.clone());

            tokio::time::sleep(Duration::from_millis(self.config.message_delay_ms)).await;
            if (i + 1) % self.config.forward_batch_size == 0 && i + 1 < survivors.len() {
                debug!("pausing between forward batches");
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }
        }

        self.checkpoint_phase(PHASE_FORWARD, last_id.as_ref(), &summary).await?;
        info!(
            "phase 2 complete: {} forwarded, {} failed",
            summary.succeeded,
            summary.failed.len()
        );
        Ok(summary)
    }

    async fn checkpoint_phase(
        &self,
        phase: &str,
        last_id: Option<&String>,
        summary: &PhaseSummary,
    ) -> Result<()> {
        let status = if summary.failed.is_empty() {
            "COMPLETED"
        } else {
            "PARTIAL"
        };
        let note = format!(
            "{}: {} processed, {} succeeded, {} skipped, {} failed",
            phase,
            summary.processed,
            summary.succeeded,
            summary.skipped,
            summary.failed.len()
        );
        self.db
            .save_checkpoint(
                last_id.map(String::as_str),
                status,
                &summary.failed,
                Some(&note),
            )
            .await
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn to_record(email: &EmailContent, details: Option<crate::models::FlightDetails>) -> EmailRecord {
    let details = details.unwrap_or_default();
    EmailRecord {
        message_id: email.message_id.clone(),
        thread_id: email.thread_id.clone(),
        subject: some_if_nonempty(&email.subject),
        from_address: some_if_nonempty(&email.from_address),
        msg_date: some_if_nonempty(&email.msg_date),
        pnr: details.booking_reference,
        flight_number: details.flight_number,
        departure_airport: details.departure_airport,
        arrival_airport: details.arrival_airport,
    }
}

fn some_if_nonempty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::MessageRef;
    use crate::models::FlightDetails;
    use anyhow::Context;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory stand-in for the Gmail collaborator. Read calls serve
    /// canned content; write calls are recorded for assertion.
    #[derive(Default)]
    struct FakeMailbox {
        refs: Vec<MessageRef>,
        messages: HashMap<String, EmailContent>,
        fail_forward: Vec<String>,
        fetched: Mutex<Vec<String>>,
        labeled: Mutex<Vec<Vec<String>>>,
        forwarded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Mailbox for Arc<FakeMailbox> {
        async fn search_messages(&self, _query: &str) -> Result<Vec<MessageRef>> {
            Ok(self.refs.clone())
        }

        async fn get_message(&self, id: &str) -> Result<EmailContent> {
            self.fetched.lock().unwrap().push(id.to_string());
            self.messages
                .get(id)
                .cloned()
                .with_context(|| format!("no such message: {}", id))
        }

        async fn ensure_label(&self, _name: &str) -> Result<String> {
            Ok("label-1".to_string())
        }

        async fn apply_label(
            &self,
            message_ids: &[String],
            _label_id: &str,
            _batch_size: usize,
        ) -> Result<()> {
            self.labeled.lock().unwrap().push(message_ids.to_vec());
            Ok(())
        }

        async fn forward_message(&self, id: &str, _to: &str) -> Result<String> {
            if self.fail_forward.iter().any(|f| f == id) {
                anyhow::bail!("backend unavailable");
            }
            self.forwarded.lock().unwrap().push(id.to_string());
            Ok(format!("sent-{}", id))
        }
    }

    fn msg_ref(id: &str) -> MessageRef {
        MessageRef {
            id: id.to_string(),
            thread_id: Some(format!("t-{}", id)),
        }
    }

    fn flight_email(id: &str) -> EmailContent {
        EmailContent {
            message_id: id.to_string(),
            thread_id: Some(format!("t-{}", id)),
            subject: "Your flight confirmation".to_string(),
            from_address: "noreply@united.com".to_string(),
            msg_date: "Mon, 3 Mar 2014 10:00:00 -0800".to_string(),
            html_body: r#"<html><body>
                <script type="application/ld+json">
                {"@type": "FlightReservation",
                 "reservationStatus": "http://schema.org/ReservationConfirmed",
                 "reservationNumber": "ABC123",
                 "reservationFor": {
                    "@type": "Flight",
                    "flightNumber": "UA456",
                    "departureAirport": {"@type": "Airport", "iataCode": "SFO"},
                    "arrivalAirport": {"@type": "Airport", "iataCode": "JFK"}}}
                </script></body></html>"#
                .to_string(),
            ..Default::default()
        }
    }

    fn newsletter_email(id: &str) -> EmailContent {
        EmailContent {
            message_id: id.to_string(),
            subject: "Weekly deals just for you".to_string(),
            from_address: "promo@example.com".to_string(),
            text_body: "Save big on shoes this week.".to_string(),
            ..Default::default()
        }
    }

    fn pending_record(id: &str, pnr: &str) -> EmailRecord {
        EmailRecord {
            message_id: id.to_string(),
            thread_id: None,
            subject: Some("Flight Confirmation".to_string()),
            from_address: Some("noreply@united.com".to_string()),
            msg_date: None,
            pnr: Some(pnr.to_string()),
            flight_number: None,
            departure_airport: None,
            arrival_airport: None,
        }
    }

    // Delays zeroed so sweeps over fakes finish immediately
    fn fast_config() -> Config {
        Config {
            message_delay_ms: 0,
            batch_pause_ms: 0,
            ..Config::default()
        }
    }

    async fn pipeline(fake: Arc<FakeMailbox>, dry_run: bool) -> Pipeline<Arc<FakeMailbox>> {
        Pipeline::new(fake, Database::connect_memory().await, fast_config(), dry_run)
    }

    #[tokio::test]
    async fn test_label_phase_skips_messages_with_success_event() {
        let fake = Arc::new(FakeMailbox {
            refs: vec![msg_ref("m1"), msg_ref("m2")],
            messages: HashMap::from([("m2".to_string(), flight_email("m2"))]),
            ..Default::default()
        });
        let pipeline = pipeline(fake.clone(), false).await;

        pipeline
            .database()
            .mark_processed("m1", PHASE_LABEL, ProcessingStatus::Success, None)
            .await
            .unwrap();

        let summary = pipeline.run_label_phase("in:inbox", "Flights").await.unwrap();

        // m1 was never fetched again; only m2 went through the sweep
        assert_eq!(*fake.fetched.lock().unwrap(), vec!["m2".to_string()]);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);
        assert!(pipeline.database().is_processed("m2", PHASE_LABEL).await.unwrap());
    }

    #[tokio::test]
    async fn test_label_phase_reattempts_previously_failed_messages() {
        let fake = Arc::new(FakeMailbox {
            refs: vec![msg_ref("m1")],
            messages: HashMap::from([("m1".to_string(), flight_email("m1"))]),
            ..Default::default()
        });
        let pipeline = pipeline(fake.clone(), false).await;

        pipeline
            .database()
            .mark_processed("m1", PHASE_LABEL, ProcessingStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let summary = pipeline.run_label_phase("in:inbox", "Flights").await.unwrap();

        // A FAILED event is not terminal; the message goes through again
        assert_eq!(*fake.fetched.lock().unwrap(), vec!["m1".to_string()]);
        assert_eq!(summary.succeeded, 1);
        assert!(pipeline.database().is_processed("m1", PHASE_LABEL).await.unwrap());
    }

    #[tokio::test]
    async fn test_label_phase_labels_hits_and_records_outcomes() {
        let fake = Arc::new(FakeMailbox {
            refs: vec![msg_ref("m1"), msg_ref("m2")],
            messages: HashMap::from([
                ("m1".to_string(), flight_email("m1")),
                ("m2".to_string(), newsletter_email("m2")),
            ]),
            ..Default::default()
        });
        let pipeline = pipeline(fake.clone(), false).await;

        let summary = pipeline.run_label_phase("in:inbox", "Flights").await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);

        // Only the confirmed flight got labeled, in one batch
        assert_eq!(*fake.labeled.lock().unwrap(), vec![vec!["m1".to_string()]]);

        // The hit is persisted with its extracted fields; the
        // newsletter left an event but no email row
        let email = pipeline.database().get_email("m1").await.unwrap().unwrap();
        assert_eq!(email.pnr.as_deref(), Some("ABC123"));
        assert!(pipeline.database().get_email("m2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_label_phase_records_bookkeeping_without_labeling() {
        let fake = Arc::new(FakeMailbox {
            refs: vec![msg_ref("m1")],
            messages: HashMap::from([("m1".to_string(), flight_email("m1"))]),
            ..Default::default()
        });
        let pipeline = pipeline(fake.clone(), true).await;

        let summary = pipeline.run_label_phase("in:inbox", "Flights").await.unwrap();
        assert_eq!(summary.succeeded, 1);

        // Bookkeeping happened: SUCCESS event, email row, checkpoint
        assert!(pipeline.database().is_processed("m1", PHASE_LABEL).await.unwrap());
        assert!(pipeline.database().get_email("m1").await.unwrap().is_some());
        assert!(pipeline.database().get_last_checkpoint().await.unwrap().is_some());

        // But the mailbox was never mutated
        assert!(fake.labeled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_forward_phase_sends_nothing() {
        let fake = Arc::new(FakeMailbox::default());
        let pipeline = pipeline(fake.clone(), true).await;

        pipeline
            .database()
            .upsert_email(&pending_record("m1", "ABC123"))
            .await
            .unwrap();

        let summary = pipeline.run_forward_phase(true).await.unwrap();
        assert_eq!(summary.succeeded, 1);

        assert!(pipeline.database().is_processed("m1", PHASE_FORWARD).await.unwrap());
        assert!(fake.forwarded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_phase_isolates_failures() {
        let fake = Arc::new(FakeMailbox {
            fail_forward: vec!["m1".to_string()],
            ..Default::default()
        });
        let pipeline = pipeline(fake.clone(), false).await;

        pipeline
            .database()
            .upsert_email(&pending_record("m1", "ABC123"))
            .await
            .unwrap();
        pipeline
            .database()
            .upsert_email(&pending_record("m2", "XYZ789"))
            .await
            .unwrap();

        let summary = pipeline.run_forward_phase(true).await.unwrap();

        // m1 failed but did not stop m2
        assert_eq!(*fake.forwarded.lock().unwrap(), vec!["m2".to_string()]);
        assert_eq!(summary.failed, vec!["m1".to_string()]);
        assert!(!pipeline.database().is_processed("m1", PHASE_FORWARD).await.unwrap());
        assert!(pipeline.database().is_processed("m2", PHASE_FORWARD).await.unwrap());

        // The failure lands in the checkpoint for the next run
        let checkpoint = pipeline.database().get_last_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.status.as_deref(), Some("PARTIAL"));
        assert_eq!(checkpoint.failed_message_ids, vec!["m1".to_string()]);
    }

    #[test]
    fn test_to_record_maps_extracted_fields() {
        let email = EmailContent {
            message_id: "m1".to_string(),
            thread_id: Some("t1".to_string()),
            subject: "Flight Confirmation".to_string(),
            from_address: "noreply@united.com".to_string(),
            ..Default::default()
        };
        let details = FlightDetails {
            booking_reference: Some("ABC123".to_string()),
            flight_number: Some("UA456".to_string()),
            ..Default::default()
        };

        let record = to_record(&email, Some(details));
        assert_eq!(record.pnr.as_deref(), Some("ABC123"));
        assert_eq!(record.flight_number.as_deref(), Some("UA456"));
        assert_eq!(record.msg_date, None);
    }

    #[test]
    fn test_to_record_without_details_leaves_fields_absent() {
        let email = EmailContent {
            message_id: "m1".to_string(),
            ..Default::default()
        };
        let record = to_record(&email, None);
        assert!(record.pnr.is_none());
        assert!(record.subject.is_none());
    }
}
