use crate::models::EmailRecord;
use tracing::{debug, info};

/// Groups and filters confirmation emails by fuzzy-matched booking
/// reference. Matching is greedy and order-dependent: each reference is
/// compared against canonical references in first-seen order and the
/// first match wins, so near-miss chains (A~B, B~C, A!~C) resolve
/// differently depending on input order. That is accepted behavior.
pub struct Deduplicator {
    fuzzy_threshold: u32,
}

impl Deduplicator {
    pub fn new(fuzzy_threshold: u32) -> Self {
        Self { fuzzy_threshold }
    }

    /// Two references match if they are case-insensitively equal or if
    /// their similarity ratio meets the threshold. An absent reference
    /// never matches anything.
    pub fn are_duplicates(&self, a: &str, b: &str) -> bool {
        if a.is_empty() || b.is_empty() {
            return false;
        }

        let a = a.to_uppercase();
        let b = b.to_uppercase();

        if a == b {
            return true;
        }

        similarity_ratio(&a, &b) >= self.fuzzy_threshold
    }

    /// Greedy in-order grouping. Returns only groups holding two or more
    /// message ids, keyed by the canonical (first-seen) reference.
    pub fn find_duplicate_groups(&self, emails: &[EmailRecord]) -> Vec<(String, Vec<String>)> {
        info!("checking {} emails for duplicates", emails.len());

        // Vec keeps canonical references in first-seen order so matching
        // stays deterministic
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();

        for email in emails {
            let Some(pnr) = email.pnr.as_deref() else {
                continue;
            };
            let pnr = pnr.to_uppercase();

            let existing = groups
                .iter_mut()
                .find(|(canonical, _)| self.are_duplicates(&pnr, canonical));

            match existing {
                Some((_, ids)) => ids.push(email.message_id.clone()),
                None => groups.push((pnr, vec![email.message_id.clone()])),
            }
        }

        groups.retain(|(_, ids)| ids.len() > 1);

        let duplicate_count: usize = groups.iter().map(|(_, ids)| ids.len()).sum();
        info!(
            "found {} duplicate groups containing {} emails",
            groups.len(),
            duplicate_count
        );

        groups
    }

    /// Keeps the first occurrence of each reference; records with no
    /// reference are always kept since they cannot be deduplicated.
    pub fn unique(&self, emails: Vec<EmailRecord>) -> Vec<EmailRecord> {
        let total = emails.len();
        let mut seen: Vec<String> = Vec::new();
        let mut kept = Vec::new();

        for email in emails {
            let Some(pnr) = email.pnr.as_deref().map(str::to_uppercase) else {
                kept.push(email);
                continue;
            };

            if let Some(matched) = seen.iter().find(|s| self.are_duplicates(&pnr, s)) {
                debug!("skipping duplicate reference {} (matches {})", pnr, matched);
                continue;
            }

            seen.push(pnr);
            kept.push(email);
        }

        info!("filtered to {} unique emails from {} total", kept.len(), total);
        kept
    }
}

/// Similarity of two strings scaled to 0..=100.
fn similarity_ratio(a: &str, b: &str) -> u32 {
    (strsim::normalized_levenshtein(a, b) * 100.0).round() as u32
}
