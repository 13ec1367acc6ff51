//! Fuzz testing for IP rule and address parsing.
//!
//! Rules come from environment variables and the admin API, so parsing must
//! never panic and a parsed rule must survive a display/parse cycle.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_ip_rules -- -max_total_time=60
//! ```

#![no_main]

use gatekeeper::middleware::ip::{CidrRange, parse_address};
use gatekeeper::middleware::ip_filter::IpRule;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = parse_address(s);

    if let Some(range) = CidrRange::parse(s) {
        // A block always contains its own network address
        assert!(range.contains(&range.network()));
    }

    if let Ok(rule) = s.parse::<IpRule>() {
        let reparsed: IpRule = rule.to_string().parse().expect("displayed rule must parse");
        assert_eq!(rule.to_string(), reparsed.to_string());
    }
});
