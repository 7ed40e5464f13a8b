#![no_main]

//! Fuzz target for `X-Proxy-To` resolution.
//!
//! Arbitrary header values and inbound URIs must never panic, and every
//! accepted target must be an absolute http(s) URI with an authority that can
//! be used to build an upstream request.

use arbitrary::Arbitrary;
use http::{HeaderMap, HeaderValue, Request, Uri};
use libfuzzer_sys::fuzz_target;
use pacegate::forwarder::{PROXY_TO_HEADER, build_upstream_request, resolve_target};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    target: &'a [u8],
    path: &'a str,
}

fuzz_target!(|input: Input<'_>| {
    let Ok(value) = HeaderValue::from_bytes(input.target) else {
        return;
    };
    let Ok(inbound) = input.path.parse::<Uri>() else {
        return;
    };

    let mut headers = HeaderMap::new();
    headers.insert(PROXY_TO_HEADER, value);

    if let Ok(target) = resolve_target(&headers, &inbound) {
        assert!(matches!(target.scheme_str(), Some("http") | Some("https")));
        assert!(target.authority().is_some());

        let Ok(request) = Request::builder().uri(inbound).body(()) else {
            return;
        };
        let (parts, ()) = request.into_parts();
        let upstream = build_upstream_request(&parts, &target, Default::default());
        assert!(upstream.is_ok(), "{upstream:?}");
    }
});
