//! Fuzz testing for signature canonicalization.
//!
//! The canonical string must not depend on the order business parameters
//! arrive in, and computing a signature over it must never panic.

#![no_main]

use arbitrary::Arbitrary;
use gatekeeper::middleware::signature::{
    SignatureAlgorithm, SigningInput, canonical_string, compute_signature,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    method: &'a str,
    path: &'a str,
    params: Vec<(String, String)>,
    timestamp: &'a str,
    nonce: Option<&'a str>,
    body: Option<&'a [u8]>,
    secret: &'a [u8],
}

fuzz_target!(|input: Input<'_>| {
    let mut reversed = input.params.clone();
    reversed.reverse();

    let forward = SigningInput {
        method: input.method,
        path: input.path,
        params: input.params,
        timestamp: input.timestamp,
        nonce: input.nonce,
        app_key: None,
        body: input.body,
    };
    let backward = SigningInput {
        params: reversed,
        ..forward.clone()
    };

    let canonical = canonical_string(&forward);
    assert_eq!(canonical, canonical_string(&backward));

    let _ = compute_signature(SignatureAlgorithm::HmacSha256, &canonical, input.secret);
    let _ = compute_signature(SignatureAlgorithm::Md5, &canonical, input.secret);
});
