use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <search_query>", args[0]);
        eprintln!("Search query matches against sender or subject.");
        std::process::exit(1);
    }

    let query = &args[1];
    let search_term = format!("%{}%", query);

    let database_url = "sqlite://flightscan.db";
    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    let row = sqlx::query(
        "SELECT message_id, from_address, subject, msg_date, pnr, flight_number, departure_airport, arrival_airport
         FROM emails
         WHERE from_address LIKE ? OR subject LIKE ?
         ORDER BY fetched_at DESC
         LIMIT 1",
    )
    .bind(&search_term)
    .bind(&search_term)
    .fetch_optional(&pool)
    .await?;

    let Some(row) = row else {
        println!("No emails found matching '{}'", query);
        return Ok(());
    };

    let message_id: String = row.get("message_id");
    let from: Option<String> = row.get("from_address");
    let subject: Option<String> = row.get("subject");
    let date: Option<String> = row.get("msg_date");
    let pnr: Option<String> = row.get("pnr");
    let flight_number: Option<String> = row.get("flight_number");
    let departure: Option<String> = row.get("departure_airport");
    let arrival: Option<String> = row.get("arrival_airport");

    println!("Found Email:");
    println!("ID: {}", message_id);
    println!("From: {:?}", from);
    println!("Subject: {:?}", subject);
    println!("Date: {:?}", date);
    println!("PNR: {:?}", pnr);
    println!("Flight: {:?}", flight_number);
    println!("Route: {:?} -> {:?}", departure, arrival);
    println!(
        "--------------------------------------------------------------------------------"
    );
    println!("Processing events:");

    let events = sqlx::query(
        "SELECT phase, status, error_message, processed_at
         FROM processing_events
         WHERE message_id = ?
         ORDER BY id ASC",
    )
    .bind(&message_id)
    .fetch_all(&pool)
    .await?;

    if events.is_empty() {
        println!("(none)");
    }
    for event in events {
        let phase: String = event.get("phase");
        let status: String = event.get("status");
        let error: Option<String> = event.get("error_message");
        let at: Option<String> = event.get("processed_at");
        println!(
            "{} | {} | {} | {}",
            at.unwrap_or_default(),
            phase,
            status,
            error.unwrap_or_default()
        );
    }

    Ok(())
}
