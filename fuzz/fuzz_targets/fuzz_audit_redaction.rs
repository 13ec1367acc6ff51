//! Fuzz testing for audit body redaction and truncation.
//!
//! Bodies are attacker-controlled. Redaction must not panic on any input and
//! truncation must always land on a character boundary within the limit.

#![no_main]

use arbitrary::Arbitrary;
use gatekeeper::middleware::audit::{TRUNCATED_SUFFIX, detect_suspicious, redact_body, truncate};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    body: &'a [u8],
    fields: Vec<String>,
    limit: u16,
    path: &'a str,
    query: Option<&'a str>,
}

fuzz_target!(|input: Input<'_>| {
    let redacted = redact_body(input.body, &input.fields);
    let limit = usize::from(input.limit);
    let cut = truncate(redacted.clone(), limit);

    if redacted.len() <= limit {
        assert_eq!(cut, redacted);
    } else {
        assert!(cut.ends_with(TRUNCATED_SUFFIX));
        assert!(cut.len() <= limit + TRUNCATED_SUFFIX.len());
    }

    let _ = detect_suspicious(input.path, input.query);
});
