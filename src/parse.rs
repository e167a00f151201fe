use crate::models::{EmailContent, FlightDetails};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

/// Three-letter tokens that look like airport codes but never are.
const AIRPORT_STOPLIST: &[&str] = &["THE", "AND", "FOR", "YOU", "NOT", "ARE", "WAS", "BUT"];

/// Cascading extractor: reservation markup, then HTML tables, then
/// free-text patterns. The first strategy that yields any field wins
/// outright; fields are never merged across strategies. A strategy that
/// chokes on malformed input counts as finding nothing.
pub struct FlightParser {
    booking_ref: Regex,
    flight_number: Regex,
    airport_pair: Regex,
    airport_code: Regex,
}

impl FlightParser {
    pub fn new() -> Self {
        Self {
            booking_ref: Regex::new(r"(?i)(?:booking|confirmation|reference|pnr)[:\s]+([A-Z0-9]{5,7})")
                .unwrap(),
            flight_number: Regex::new(r"\b([A-Z]{2}\s?\d{3,4})\b").unwrap(),
            airport_pair: Regex::new(r"\b([A-Z]{3})\s*(?:to|→|-|–)\s*([A-Z]{3})\b").unwrap(),
            airport_code: Regex::new(r"\b([A-Z]{3})\b").unwrap(),
        }
    }

    pub fn parse(&self, email: &EmailContent) -> Option<FlightDetails> {
        if !email.html_body.is_empty() {
            if let Some(details) = parse_reservation_markup(&email.html_body) {
                debug!(message_id = %email.message_id, "parsed via reservation markup");
                return Some(details);
            }
            if let Some(details) = self.parse_html_tables(&email.html_body) {
                debug!(message_id = %email.message_id, "parsed via html tables");
                return Some(details);
            }
        }

        let mut combined = String::new();
        if !email.html_body.is_empty() {
            combined.push_str(&html_to_text(&email.html_body));
            combined.push(' ');
        }
        combined.push_str(&email.text_body);

        if let Some(details) = self.extract_from_text(&combined) {
            debug!(message_id = %email.message_id, "parsed via text patterns");
            return Some(details);
        }

        debug!(message_id = %email.message_id, "all parsing strategies found nothing");
        None
    }

    fn extract_from_text(&self, text: &str) -> Option<FlightDetails> {
        let mut details = FlightDetails::default();

        if let Some(caps) = self.booking_ref.captures(text) {
            details.booking_reference = Some(caps[1].to_uppercase());
        }

        if let Some(caps) = self.flight_number.captures(text) {
            details.flight_number = Some(caps[1].replace(' ', ""));
        }

        if let Some(caps) = self.airport_pair.captures(text) {
            details.departure_airport = Some(caps[1].to_string());
            details.arrival_airport = Some(caps[2].to_string());
        } else {
            // Fall back to the first two airport-shaped tokens that are
            // not common English words
            let codes: Vec<&str> = self
                .airport_code
                .find_iter(text)
                .map(|m| m.as_str())
                .filter(|c| !AIRPORT_STOPLIST.contains(c))
                .collect();
            if codes.len() >= 2 {
                details.departure_airport = Some(codes[0].to_string());
                details.arrival_airport = Some(codes[1].to_string());
            }
        }

        if details.is_empty() { None } else { Some(details) }
    }

    /// Strategy 2: the first table mentioning flight/booking/departure/arrival,
    /// read as two-cell (label, value) rows.
    fn parse_html_tables(&self, html: &str) -> Option<FlightDetails> {
        let document = Html::parse_document(html);
        let table_selector = Selector::parse("table").unwrap();
        let row_selector = Selector::parse("tr").unwrap();
        let cell_selector = Selector::parse("td, th").unwrap();

        for table in document.select(&table_selector) {
            let table_text = table.text().collect::<String>().to_lowercase();
            if !["flight", "booking", "departure", "arrival"]
                .iter()
                .any(|kw| table_text.contains(kw))
            {
                continue;
            }

            let mut details = FlightDetails::default();

            for row in table.select(&row_selector) {
                let cells: Vec<_> = row.select(&cell_selector).collect();
                if cells.len() < 2 {
                    continue;
                }
                let label = cells[0].text().collect::<String>().trim().to_lowercase();
                let value = cells[1].text().collect::<String>().trim().to_string();

                if (label.contains("booking") || label.contains("confirmation") || label.contains("pnr"))
                    && value.len() >= 5
                {
                    details.booking_reference = Some(value);
                } else if label.contains("flight") && label.contains("number") {
                    details.flight_number = Some(value);
                } else if label.contains("departure") {
                    if label.contains("airport") || label.contains("from") {
                        if let Some(caps) = self.airport_code.captures(&value) {
                            details.departure_airport = Some(caps[1].to_string());
                        }
                    }
                } else if (label.contains("arrival") || label.contains("destination"))
                    && (label.contains("airport") || label.contains("to"))
                {
                    if let Some(caps) = self.airport_code.captures(&value) {
                        details.arrival_airport = Some(caps[1].to_string());
                    }
                }
            }

            if !details.is_empty() {
                return Some(details);
            }
        }

        None
    }
}

impl Default for FlightParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Strategy 1: schema.org FlightReservation markup, JSON-LD form first,
/// then microdata. The first reservation object yielding any field wins.
fn parse_reservation_markup(html: &str) -> Option<FlightDetails> {
    let document = Html::parse_document(html);

    let script_selector = Selector::parse(r#"script[type="application/ld+json"]"#).unwrap();
    for script in document.select(&script_selector) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        let items: Vec<&serde_json::Value> = match &value {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for item in items {
            if item.get("@type").and_then(|t| t.as_str()) != Some("FlightReservation") {
                continue;
            }
            let details = details_from_json_ld(item);
            if !details.is_empty() {
                return Some(details);
            }
        }
    }

    parse_microdata(&document)
}

fn details_from_json_ld(item: &serde_json::Value) -> FlightDetails {
    let mut details = FlightDetails::default();

    details.booking_reference = item
        .get("reservationNumber")
        .and_then(|v| v.as_str())
        .map(String::from);

    let flight = item.get("reservationFor");
    if let Some(flight) = flight {
        if flight.get("@type").and_then(|t| t.as_str()) == Some("Flight") {
            details.flight_number = flight
                .get("flightNumber")
                .and_then(|v| v.as_str())
                .map(String::from);
            details.departure_airport = flight
                .get("departureAirport")
                .and_then(|a| a.get("iataCode"))
                .and_then(|v| v.as_str())
                .map(String::from);
            details.arrival_airport = flight
                .get("arrivalAirport")
                .and_then(|a| a.get("iataCode"))
                .and_then(|v| v.as_str())
                .map(String::from);
            details.departure_time = flight
                .get("departureTime")
                .and_then(|v| v.as_str())
                .map(String::from);
            details.arrival_time = flight
                .get("arrivalTime")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
    }

    details
}

fn parse_microdata(document: &Html) -> Option<FlightDetails> {
    let reservation_selector =
        Selector::parse(r#"div[itemtype="http://schema.org/FlightReservation"]"#).unwrap();
    let reservation = document.select(&reservation_selector).next()?;

    let mut details = FlightDetails::default();

    let res_num_selector = Selector::parse(r#"meta[itemprop="reservationNumber"]"#).unwrap();
    if let Some(meta) = reservation.select(&res_num_selector).next() {
        if let Some(content) = meta.value().attr("content") {
            details.booking_reference = Some(content.to_string());
        }
    }

    let flight_selector = Selector::parse(r#"div[itemtype="http://schema.org/Flight"]"#).unwrap();
    if let Some(flight) = reservation.select(&flight_selector).next() {
        let flight_num_selector = Selector::parse(r#"meta[itemprop="flightNumber"]"#).unwrap();
        if let Some(meta) = flight.select(&flight_num_selector).next() {
            if let Some(content) = meta.value().attr("content") {
                details.flight_number = Some(content.to_string());
            }
        }

        // First two Airport blocks are departure and arrival, in order
        let airport_selector =
            Selector::parse(r#"div[itemtype="http://schema.org/Airport"]"#).unwrap();
        let iata_selector = Selector::parse(r#"meta[itemprop="iataCode"]"#).unwrap();
        let airports: Vec<_> = flight.select(&airport_selector).collect();
        if airports.len() >= 2 {
            if let Some(meta) = airports[0].select(&iata_selector).next() {
                if let Some(content) = meta.value().attr("content") {
                    details.departure_airport = Some(content.to_string());
                }
            }
            if let Some(meta) = airports[1].select(&iata_selector).next() {
                if let Some(content) = meta.value().attr("content") {
                    details.arrival_airport = Some(content.to_string());
                }
            }
        }
    }

    if details.is_empty() { None } else { Some(details) }
}

/// Strips markup so strategy 3 can pattern-match visible text.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(html: &str, text: &str) -> EmailContent {
        EmailContent {
            message_id: "m1".to_string(),
            html_body: html.to_string(),
            text_body: text.to_string(),
            ..Default::default()
        }
    }

    const FULL_JSON_LD: &str = r#"<html><body>
        <script type="application/ld+json">
        {"@type": "FlightReservation",
         "reservationNumber": "ABC123",
         "reservationFor": {
            "@type": "Flight",
            "flightNumber": "UA456",
            "departureAirport": {"@type": "Airport", "iataCode": "SFO"},
            "arrivalAirport": {"@type": "Airport", "iataCode": "JFK"},
            "departureTime": "2014-03-04T20:15:00-08:00",
            "arrivalTime": "2014-03-05T06:30:00-05:00"}}
        </script></body></html>"#;

    #[test]
    fn test_json_ld_extracts_all_fields() {
        let parser = FlightParser::new();
        let details = parser.parse(&email(FULL_JSON_LD, "")).unwrap();
        assert_eq!(details.booking_reference.as_deref(), Some("ABC123"));
        assert_eq!(details.flight_number.as_deref(), Some("UA456"));
        assert_eq!(details.departure_airport.as_deref(), Some("SFO"));
        assert_eq!(details.arrival_airport.as_deref(), Some("JFK"));
        assert_eq!(
            details.departure_time.as_deref(),
            Some("2014-03-04T20:15:00-08:00")
        );
    }

    #[test]
    fn test_markup_wins_over_conflicting_table() {
        let parser = FlightParser::new();
        let html = format!(
            "{}{}",
            FULL_JSON_LD,
            r#"<table><tr><td>Booking Reference</td><td>ZZZ999</td></tr>
               <tr><td>Flight Number</td><td>DL111</td></tr></table>"#
        );
        let details = parser.parse(&email(&html, "")).unwrap();
        // No field mixing: the markup strategy supplies every field
        assert_eq!(details.booking_reference.as_deref(), Some("ABC123"));
        assert_eq!(details.flight_number.as_deref(), Some("UA456"));
    }

    #[test]
    fn test_malformed_json_ld_falls_through_to_tables() {
        let parser = FlightParser::new();
        let html = r#"<script type="application/ld+json">{not json at all</script>
            <table>
            <tr><td>Booking Reference</td><td>XYZ789</td></tr>
            <tr><td>Flight Number</td><td>DL2021</td></tr>
            <tr><td>Departure Airport</td><td>Seattle (SEA)</td></tr>
            <tr><td>Arrival Airport</td><td>Boston (BOS)</td></tr>
            </table>"#;
        let details = parser.parse(&email(html, "")).unwrap();
        assert_eq!(details.booking_reference.as_deref(), Some("XYZ789"));
        assert_eq!(details.flight_number.as_deref(), Some("DL2021"));
        assert_eq!(details.departure_airport.as_deref(), Some("SEA"));
        assert_eq!(details.arrival_airport.as_deref(), Some("BOS"));
    }

    #[test]
    fn test_table_without_flight_keywords_skipped() {
        let parser = FlightParser::new();
        let html = r#"<table><tr><td>Order Number</td><td>QQQ111</td></tr></table>"#;
        assert!(parser.parse(&email(html, "")).is_none());
    }

    #[test]
    fn test_short_table_reference_rejected() {
        // Values under 5 chars are too short to be a PNR
        let parser = FlightParser::new();
        let html = r#"<table><tr><td>Booking</td><td>AB1</td></tr>
            <tr><td>Flight Number</td><td>UA9</td></tr></table>"#;
        let details = parser.parse_html_tables(html).unwrap();
        assert!(details.booking_reference.is_none());
        assert_eq!(details.flight_number.as_deref(), Some("UA9"));
    }

    #[test]
    fn test_text_extraction_with_explicit_airport_pair() {
        let parser = FlightParser::new();
        let text = "Your booking: def456. Flight UA 456 from SFO to JFK departs Tuesday.";
        let details = parser.parse(&email("", text)).unwrap();
        assert_eq!(details.booking_reference.as_deref(), Some("DEF456"));
        assert_eq!(details.flight_number.as_deref(), Some("UA456"));
        assert_eq!(details.departure_airport.as_deref(), Some("SFO"));
        assert_eq!(details.arrival_airport.as_deref(), Some("JFK"));
    }

    #[test]
    fn test_airport_fallback_skips_stoplist_words() {
        let parser = FlightParser::new();
        let text = "THE flight AND crew. Depart LAX, arrive ORD.";
        let details = parser.extract_from_text(text).unwrap();
        assert_eq!(details.departure_airport.as_deref(), Some("LAX"));
        assert_eq!(details.arrival_airport.as_deref(), Some("ORD"));
    }

    #[test]
    fn test_nothing_extractable_returns_none() {
        let parser = FlightParser::new();
        assert!(parser.parse(&email("", "Hello, see you at lunch.")).is_none());
    }
}
