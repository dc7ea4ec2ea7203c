//! Header model tests
//!
//! Raw-line round trips for every variant and the cookie parsing examples.

use proptest::prelude::*;
use tapwire::headers::{
    Header, HeaderSet, Http1RequestHeaders, Http1ResponseHeaders, Http2RequestHeaders,
    Http2ResponseHeaders, NameValue, RequestHeaders, ResponseHeaders,
};

fn header_strategy() -> impl Strategy<Value = Header> {
    ("[A-Za-z][A-Za-z0-9-]{0,15}", "[ -~]{0,40}").prop_map(|(name, value)| Header::new(name, value))
}

fn headers_strategy() -> impl Strategy<Value = Vec<Header>> {
    prop::collection::vec(header_strategy(), 0..12)
}

proptest! {
    #[test]
    fn http1_request_round_trip(
        method in "[A-Z]{3,7}",
        path in "/[A-Za-z0-9/._~?=&-]{0,30}",
        minor in 0u8..=1,
        headers in headers_strategy(),
    ) {
        let original = RequestHeaders::Http1(Http1RequestHeaders::new(
            method.as_str(),
            path.as_str(),
            format!("HTTP/1.{}", minor),
            headers,
        ));
        let parsed = RequestHeaders::parse_raw_lines(&original.raw_lines()).unwrap();

        prop_assert_eq!(parsed.raw_lines(), original.raw_lines());
        prop_assert_eq!(parsed.method(), method.as_str());
        prop_assert_eq!(parsed.path(), path.as_str());
        prop_assert_eq!(parsed.headers(), original.headers());
    }

    #[test]
    fn http2_request_round_trip(
        scheme in "https?",
        method in "[A-Z]{3,7}",
        path in "/[A-Za-z0-9/._~?=&-]{0,30}",
        authority in "([a-z]{1,10}\\.[a-z]{2,3}(:[0-9]{2,5})?)?",
        headers in headers_strategy(),
    ) {
        let original = RequestHeaders::Http2(Http2RequestHeaders::with_authority(
            headers,
            scheme.as_str(),
            method.as_str(),
            path.as_str(),
            authority.as_str(),
        ));
        let parsed = RequestHeaders::parse_raw_lines(&original.raw_lines()).unwrap();

        prop_assert!(parsed.is_http2());
        prop_assert_eq!(parsed.raw_lines(), original.raw_lines());
        prop_assert_eq!(&parsed, &original);
    }

    #[test]
    fn http1_response_round_trip(
        status in 100u16..600,
        reason in "([A-Za-z][A-Za-z ]{0,20})?",
        headers in headers_strategy(),
    ) {
        let original = ResponseHeaders::Http1(Http1ResponseHeaders::new(
            "HTTP/1.1",
            status,
            reason.as_str(),
            headers,
        ));
        let parsed = ResponseHeaders::parse_raw_lines(&original.raw_lines()).unwrap();

        prop_assert_eq!(parsed.raw_lines(), original.raw_lines());
        prop_assert_eq!(parsed.status(), status);
        prop_assert_eq!(parsed.reason(), reason.as_str());
    }

    #[test]
    fn http2_response_round_trip(status in 100u16..600, headers in headers_strategy()) {
        let original = ResponseHeaders::Http2(Http2ResponseHeaders::new(status, headers));
        let parsed = ResponseHeaders::parse_raw_lines(&original.raw_lines()).unwrap();

        prop_assert_eq!(&parsed, &original);
    }
}

fn request_with_cookies(values: &[&str]) -> RequestHeaders {
    let headers = values.iter().map(|v| Header::new("Cookie", *v)).collect();
    RequestHeaders::Http1(Http1RequestHeaders::new("GET", "/", "HTTP/1.1", headers))
}

#[test]
fn test_cookie_values_examples() {
    let request = request_with_cookies(&["a=1; b=2"]);
    assert_eq!(
        request.cookie_values(),
        vec![NameValue::new("a", "1"), NameValue::new("b", "2")]
    );

    let request = request_with_cookies(&["flag; x=; =y"]);
    assert_eq!(
        request.cookie_values(),
        vec![
            NameValue::new("flag", ""),
            NameValue::new("x", ""),
            NameValue::new("", "y"),
        ]
    );
}

#[test]
fn test_cookie_values_skip_empty_segments_and_span_headers() {
    let request = request_with_cookies(&[" a=1 ;; ", "b=2"]);
    assert_eq!(
        request.cookie_values(),
        vec![NameValue::new("a", "1"), NameValue::new("b", "2")]
    );
}

#[test]
fn test_http2_cookie_values() {
    let request = RequestHeaders::Http2(Http2RequestHeaders::new(
        vec![Header::new("cookie", "sid=42"), Header::new("cookie", "theme=dark")],
        "https",
        "GET",
        "/",
    ));
    assert_eq!(
        request.cookie_values(),
        vec![NameValue::new("sid", "42"), NameValue::new("theme", "dark")]
    );
}

#[test]
fn test_http2_missing_pseudo_header_is_rejected() {
    let lines = vec![":scheme: https", ":path: /"];
    assert!(RequestHeaders::parse_raw_lines(&lines).is_err());
}

#[test]
fn test_lookup_is_case_insensitive() {
    let request = Http1RequestHeaders::new(
        "POST",
        "/upload",
        "HTTP/1.1",
        vec![
            Header::new("content-type", "application/json"),
            Header::new("Content-Length", " 42 "),
        ],
    );
    assert_eq!(request.content_type(), Some("application/json"));
    assert_eq!(request.content_length(), Some(42));
    assert!(request.has_header("CONTENT-TYPE"));
}

#[test]
fn test_keep_alive_rules() {
    let http10 = Http1ResponseHeaders::new("HTTP/1.0", 200, "OK", vec![]);
    assert!(!http10.is_keep_alive());

    let http10_ka = Http1ResponseHeaders::new(
        "HTTP/1.0",
        200,
        "OK",
        vec![Header::new("Connection", "Keep-Alive")],
    );
    assert!(http10_ka.is_keep_alive());

    let http11_close = Http1RequestHeaders::new(
        "GET",
        "/",
        "HTTP/1.1",
        vec![Header::new("Connection", "close")],
    );
    assert!(!http11_close.is_keep_alive());
}
