use crate::models::{Checkpoint, EmailRecord, PhaseStat, ProcessingStatus};
use anyhow::Result;
use sqlx::{Row, sqlite::SqlitePool};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        // sqlx prepares single statements, so apply the schema one statement at a time
        for statement in schema.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub async fn upsert_email(&self, email: &EmailRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO emails (message_id, thread_id, subject, from_address, msg_date, pnr, flight_number, departure_airport, arrival_airport)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET thread_id=excluded.thread_id, subject=excluded.subject,
             from_address=excluded.from_address, msg_date=excluded.msg_date, pnr=excluded.pnr,
             flight_number=excluded.flight_number, departure_airport=excluded.departure_airport,
             arrival_airport=excluded.arrival_airport"
        )
        .bind(&email.message_id)
        .bind(&email.thread_id)
        .bind(&email.subject)
        .bind(&email.from_address)
        .bind(&email.msg_date)
        .bind(&email.pnr)
        .bind(&email.flight_number)
        .bind(&email.departure_airport)
        .bind(&email.arrival_airport)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_email(&self, message_id: &str) -> Result<Option<EmailRecord>> {
        let row = sqlx::query(
            "SELECT message_id, thread_id, subject, from_address, msg_date, pnr, flight_number, departure_airport, arrival_airport
             FROM emails WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(email_from_row))
    }

    /// A message is done for a phase once any SUCCESS event exists for it.
    /// FAILED and SKIPPED events do not count; those messages are retried
    /// on the next sweep.
    pub async fn is_processed(&self, message_id: &str, phase: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM processing_events
             WHERE message_id = ? AND phase = ? AND status = 'SUCCESS'
             LIMIT 1",
        )
        .bind(message_id)
        .bind(phase)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Appends an event to the ledger. Events are never updated or
    /// deleted, so an interrupted run leaves prior outcomes intact.
    pub async fn mark_processed(
        &self,
        message_id: &str,
        phase: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO processing_events (message_id, phase, status, error_message)
             VALUES (?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(phase)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Emails with no SUCCESS event for the given phase, in insertion order.
    pub async fn get_unprocessed(&self, phase: &str) -> Result<Vec<EmailRecord>> {
        let rows = sqlx::query(
            "SELECT e.message_id, e.thread_id, e.subject, e.from_address, e.msg_date, e.pnr, e.flight_number, e.departure_airport, e.arrival_airport
             FROM emails e
             WHERE NOT EXISTS (
                 SELECT 1 FROM processing_events p
                 WHERE p.message_id = e.message_id
                 AND p.phase = ?
                 AND p.status = 'SUCCESS'
             )
             ORDER BY e.rowid ASC",
        )
        .bind(phase)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(email_from_row).collect())
    }

    pub async fn get_stats(&self) -> Result<Vec<PhaseStat>> {
        let rows = sqlx::query(
            "SELECT phase, status, COUNT(*) as count
             FROM processing_events
             GROUP BY phase, status
             ORDER BY phase, status",
        )
        .fetch_all(&self.pool)
        .await?;

        let stats = rows
            .into_iter()
            .map(|row| PhaseStat {
                phase: row.get(0),
                status: row.get(1),
                count: row.get(2),
            })
            .collect();

        Ok(stats)
    }

    pub async fn save_checkpoint(
        &self,
        last_message_id: Option<&str>,
        status: &str,
        failed_message_ids: &[String],
        note: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (last_message_id, status, failed_message_ids, note)
             VALUES (?, ?, ?, ?)",
        )
        .bind(last_message_id)
        .bind(status)
        .bind(serde_json::to_string(failed_message_ids)?)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_last_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT id, last_message_id, last_sync_time, status, failed_message_ids, note
             FROM checkpoints
             ORDER BY id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let checkpoint = row.map(|row| {
            let failed_json: Option<String> = row.get(4);
            let failed_message_ids = failed_json
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();
            Checkpoint {
                id: row.get(0),
                last_message_id: row.get(1),
                last_sync_time: row.get(2),
                status: row.get(3),
                failed_message_ids,
                note: row.get(5),
            }
        });

        Ok(checkpoint)
    }
}

#[cfg(test)]
impl Database {
    /// In-memory database with the schema applied. A pool over
    /// `:memory:` gets a fresh database per connection, so pin it to a
    /// single connection.
    pub(crate) async fn connect_memory() -> Database {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        let db = Database { pool };
        db.run_migrations().await.unwrap();
        db
    }
}

fn email_from_row(row: sqlx::sqlite::SqliteRow) -> EmailRecord {
    EmailRecord {
        message_id: row.get(0),
        thread_id: row.get(1),
        subject: row.get(2),
        from_address: row.get(3),
        msg_date: row.get(4),
        pnr: row.get(5),
        flight_number: row.get(6),
        departure_airport: row.get(7),
        arrival_airport: row.get(8),
    }
}
