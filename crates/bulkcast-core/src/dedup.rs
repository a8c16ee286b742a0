//! Recipient deduplication

use bulkcast_common::types::PhoneNumber;
use bulkcast_storage::models::Recipient;
use std::collections::HashSet;

/// Comparison key for an address; phone numbers compare in E.164 form
pub fn dedup_key(address: &str) -> String {
    PhoneNumber::parse(address)
        .map(|number| number.as_str().to_string())
        .unwrap_or_else(|| address.trim().to_string())
}

/// Keep the first occurrence of each address, preserving order.
/// With `enabled == false` the list passes through unchanged.
pub fn dedup_recipients(recipients: Vec<Recipient>, enabled: bool) -> Vec<Recipient> {
    if !enabled {
        return recipients;
    }

    let mut seen = HashSet::with_capacity(recipients.len());
    recipients
        .into_iter()
        .filter(|recipient| seen.insert(dedup_key(&recipient.address)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn addresses(recipients: &[Recipient]) -> Vec<&str> {
        recipients.iter().map(|r| r.address.as_str()).collect()
    }

    #[test]
    fn test_duplicate_address_kept_once() {
        let recipients = vec![
            Recipient::new("+123"),
            Recipient::new("+456"),
            Recipient::new("+123"),
        ];

        let filtered = dedup_recipients(recipients, true);
        assert_eq!(addresses(&filtered), vec!["+123", "+456"]);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let first = Recipient::new("+15550000001").with_variable("name", "first");
        let second = Recipient::new("+15550000001").with_variable("name", "second");

        let filtered = dedup_recipients(vec![first.clone(), second], true);
        assert_eq!(filtered, vec![first]);
    }

    #[test]
    fn test_formatting_differences_are_duplicates() {
        let recipients = vec![
            Recipient::new("+1 (555) 000-0001"),
            Recipient::new("+15550000001"),
            Recipient::new("+15550000002"),
        ];

        let filtered = dedup_recipients(recipients, true);
        assert_eq!(addresses(&filtered), vec!["+1 (555) 000-0001", "+15550000002"]);
    }

    #[test]
    fn test_disabled_passes_through() {
        let recipients = vec![
            Recipient::new("+123"),
            Recipient::new("+123"),
            Recipient::new("+456"),
        ];

        let filtered = dedup_recipients(recipients.clone(), false);
        assert_eq!(filtered, recipients);
    }
}
