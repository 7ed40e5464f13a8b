#![no_main]

//! Fuzz target for header redaction.
//!
//! Both the log-time view (`sanitize_headers`) and the audit-record view
//! (`redact_header_map`) must never panic and must never show the value of a
//! sensitive header.

use arbitrary::Arbitrary;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use libfuzzer_sys::fuzz_target;
use pacegate::logging_layer::{self, SENSITIVE_HEADERS};
use std::collections::BTreeMap;

#[derive(Arbitrary, Debug)]
struct Input {
    headers: Vec<(Vec<u8>, Vec<u8>)>,
}

fuzz_target!(|input: Input| {
    let mut header_map = HeaderMap::new();
    for (name, value) in input.headers.iter().take(100) {
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name), HeaderValue::from_bytes(value))
        else {
            continue;
        };
        header_map.insert(name, value);
    }

    let shown = format!("{:?}", logging_layer::sanitize_headers(&header_map));

    let flattened: BTreeMap<String, String> = header_map
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let redacted = logging_layer::redact_header_map(&flattened);

    for sensitive in SENSITIVE_HEADERS {
        if header_map.contains_key(*sensitive) {
            assert_eq!(redacted.get(*sensitive), Some(&"[REDACTED]"));
        }
    }

    // Replacing every sensitive value must not change the log output.
    let mut masked = header_map.clone();
    for sensitive in SENSITIVE_HEADERS {
        if masked.contains_key(*sensitive) {
            masked.insert(*sensitive, HeaderValue::from_static("masked"));
        }
    }
    assert_eq!(
        shown,
        format!("{:?}", logging_layer::sanitize_headers(&masked)),
        "sensitive header value leaked into log output"
    );
});
