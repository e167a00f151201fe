use crate::models::EmailContent;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

const CONFIRMATION_PATTERNS: &[&str] = &[
    r"(?i)(flight|booking|reservation).*confirm(ed|ation)",
    r"(?i)confirm.*flight",
    r"(?i)itinerary.*confirm",
    r"(?i)booking.*confirm",
];

const EXCLUSION_PATTERNS: &[&str] = &[
    r"(?i)cancel",
    r"(?i)check[\s-]*in",
    r"(?i)(change|update|modif)",
    r"(?i)reminder",
    r"(?i)expired",
];

const AIRLINE_DOMAINS: &[&str] = &[
    "united.com",
    "delta.com",
    "aa.com",
    "americanairlines.com",
    "southwest.com",
    "luv.southwest.com",
    "jetblue.com",
    "alaskaair.com",
    "spirit.com",
    "frontier.com",
    "expedia.com",
    "welcomemail.expedia.com",
    "kayak.com",
    "priceline.com",
];

/// The score at which an email counts as a flight confirmation. Equal to
/// the reservation-markup weight, so that signal is decisive on its own.
pub const SCORE_THRESHOLD: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub is_flight: bool,
    pub score: u32,
}

/// Scores an email as flight-confirmation-or-not from independent
/// weighted signals. No signal is penalized for being absent; the only
/// veto is an exclusion phrase in the subject voiding the subject signal.
pub struct FlightClassifier {
    confirmation_patterns: Vec<Regex>,
    exclusion_patterns: Vec<Regex>,
    confirmation_code: Regex,
    flight_number: Regex,
    airport_code: Regex,
    booking_ref: Regex,
}

impl FlightClassifier {
    pub fn new() -> Self {
        Self {
            confirmation_patterns: CONFIRMATION_PATTERNS
                .iter()
                .map(|p| Regex::new(p).unwrap())
                .collect(),
            exclusion_patterns: EXCLUSION_PATTERNS
                .iter()
                .map(|p| Regex::new(p).unwrap())
                .collect(),
            confirmation_code: Regex::new(r"\b[A-Z0-9]{6}\b").unwrap(),
            flight_number: Regex::new(r"\b[A-Z]{2}\d{1,4}\b").unwrap(),
            airport_code: Regex::new(r"\b[A-Z]{3}\b").unwrap(),
            booking_ref: Regex::new(r"(?i)(confirmation|booking|reservation|pnr).{0,20}([A-Z0-9]{5,6})")
                .unwrap(),
        }
    }

    pub fn classify(&self, email: &EmailContent) -> Classification {
        let mut score = 0;

        if !email.html_body.is_empty() && has_reservation_markup(&email.html_body) {
            score += 50;
            debug!(message_id = %email.message_id, "reservation markup found");
        }

        if self.is_airline_domain(&email.from_address) {
            score += 20;
            debug!(message_id = %email.message_id, from = %email.from_address, "airline sender");
        }

        if self.is_confirmation_subject(&email.subject) {
            score += 20;
            debug!(message_id = %email.message_id, "confirmation subject");
        }

        let combined = format!("{} {}", email.subject, email.text_body);
        if self.has_flight_markers(&combined) {
            score += 10;
            debug!(message_id = %email.message_id, "flight markers in content");
        }

        Classification {
            is_flight: score >= SCORE_THRESHOLD,
            score,
        }
    }

    /// Subject must match a confirmation pattern and none of the
    /// exclusions (cancellations, check-in notices, changes, reminders).
    fn is_confirmation_subject(&self, subject: &str) -> bool {
        let has_confirm = self
            .confirmation_patterns
            .iter()
            .any(|p| p.is_match(subject));
        let has_exclusion = self.exclusion_patterns.iter().any(|p| p.is_match(subject));
        has_confirm && !has_exclusion
    }

    fn is_airline_domain(&self, from_address: &str) -> bool {
        let from_lower = from_address.to_lowercase();
        AIRLINE_DOMAINS.iter().any(|d| from_lower.contains(d))
    }

    /// At least 3 of 4 textual markers: confirmation-code-shaped token,
    /// flight-number-shaped token, two or more airport-code-shaped
    /// tokens, and a booking reference near a keyword.
    fn has_flight_markers(&self, text: &str) -> bool {
        let markers = [
            self.confirmation_code.is_match(text),
            self.flight_number.is_match(text),
            self.airport_code.find_iter(text).count() >= 2,
            self.booking_ref.is_match(text),
        ];
        markers.iter().filter(|&&m| m).count() >= 3
    }
}

impl Default for FlightClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Looks for machine-readable reservation markup declaring a confirmed
/// FlightReservation: JSON-LD script blocks first, then microdata.
fn has_reservation_markup(html: &str) -> bool {
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
            if item.get("@type").and_then(|t| t.as_str()) == Some("FlightReservation") {
                let status = item
                    .get("reservationStatus")
                    .and_then(|s| s.as_str())
                    .unwrap_or("");
                if status.contains("Confirmed") {
                    return true;
                }
            }
        }
    }

    let microdata_selector =
        Selector::parse(r#"div[itemtype="http://schema.org/FlightReservation"]"#).unwrap();
    document.select(&microdata_selector).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(subject: &str, from: &str, html: &str, text: &str) -> EmailContent {
        EmailContent {
            message_id: "m1".to_string(),
            subject: subject.to_string(),
            from_address: from.to_string(),
            html_body: html.to_string(),
            text_body: text.to_string(),
            ..Default::default()
        }
    }

    const CONFIRMED_JSON_LD: &str = r#"<html><body>
        <script type="application/ld+json">
        {"@type": "FlightReservation", "reservationStatus": "http://schema.org/ReservationConfirmed"}
        </script></body></html>"#;

    #[test]
    fn test_markup_signal_alone_is_decisive() {
        let classifier = FlightClassifier::new();
        let result = classifier.classify(&email("", "", CONFIRMED_JSON_LD, ""));
        assert!(result.is_flight);
        assert_eq!(result.score, 50);
    }

    #[test]
    fn test_markup_with_pending_status_does_not_score() {
        let classifier = FlightClassifier::new();
        let html = r#"<script type="application/ld+json">
            {"@type": "FlightReservation", "reservationStatus": "ReservationPending"}
            </script>"#;
        let result = classifier.classify(&email("", "", html, ""));
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_json_ld_list_form_detected() {
        let classifier = FlightClassifier::new();
        let html = r#"<script type="application/ld+json">
            [{"@type": "Organization"}, {"@type": "FlightReservation", "reservationStatus": "Confirmed"}]
            </script>"#;
        assert!(classifier.classify(&email("", "", html, "")).is_flight);
    }

    #[test]
    fn test_microdata_form_detected() {
        let classifier = FlightClassifier::new();
        let html = r#"<div itemscope itemtype="http://schema.org/FlightReservation"></div>"#;
        assert!(classifier.classify(&email("", "", html, "")).is_flight);
    }

    #[test]
    fn test_exclusion_phrase_vetoes_subject_signal() {
        let classifier = FlightClassifier::new();
        // Confirmation phrase present but "Cancelled" voids the subject
        // signal; airline domain alone scores 20
        let result = classifier.classify(&email(
            "Flight Confirmation - Cancelled",
            "noreply@united.com",
            "",
            "",
        ));
        assert!(!result.is_flight);
        assert_eq!(result.score, 20);
    }

    #[test]
    fn test_checkin_subject_excluded() {
        let classifier = FlightClassifier::new();
        let result = classifier.classify(&email(
            "Check-in now: your booking is confirmed",
            "",
            "",
            "",
        ));
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_weak_signals_accumulate_past_threshold() {
        let classifier = FlightClassifier::new();
        let text = "Your confirmation code is ABC123. Flight UA456 from SFO to JFK departs soon.";
        let result = classifier.classify(&email(
            "Your flight booking is confirmed",
            "itinerary@delta.com",
            "",
            text,
        ));
        // sender 20 + subject 20 + markers 10
        assert!(result.is_flight);
        assert_eq!(result.score, 50);
    }

    #[test]
    fn test_newsletter_scores_below_threshold() {
        let classifier = FlightClassifier::new();
        let result = classifier.classify(&email(
            "Newsletter: Travel Deals",
            "marketing@example.com",
            "",
            "Great deals on flights this week!",
        ));
        assert!(!result.is_flight);
        assert!(result.score < 50);
    }

    #[test]
    fn test_markers_need_three_of_four() {
        let classifier = FlightClassifier::new();
        // Only a flight number and a single airport code: two markers at
        // most, no signal
        assert!(!classifier.has_flight_markers("UA456 departs SFO at noon"));
        assert!(classifier.has_flight_markers(
            "Booking ABC123 confirmed. Flight UA456 from SFO to JFK."
        ));
    }
}
