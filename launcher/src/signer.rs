//! AWS Signature Version 4 request signing.
//!
//! The signer is a pure function of its inputs: the caller captures the
//! request timestamp once and passes it in, so the same inputs always produce
//! the same `authorization` header.

use crate::config::Credentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const AUTHORIZATION: &str = "authorization";
pub const AMZ_DATE: &str = "x-amz-date";

const TERMINATOR: &str = "aws4_request";

/// Lower-cased header name to value. Keys are unique and iterate sorted.
pub type Headers = BTreeMap<String, String>;

/// Everything about a request that goes into its signature, apart from the
/// headers and credentials.
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub uri_path: &'a str,
    pub query: &'a str,
    pub payload: &'a [u8],
    pub region: &'a str,
    pub service: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl SigningRequest<'_> {
    fn date_stamp(&self) -> String {
        self.timestamp.format("%Y%m%d").to_string()
    }

    fn scope(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.date_stamp(),
            self.region,
            self.service,
            TERMINATOR
        )
    }
}

/// `x-amz-date` representation of a timestamp, e.g. `20150830T123600Z`.
pub fn amz_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Signs the request and returns `headers` with an `authorization` header
/// added. Header names are expected to be lower case already.
pub fn sign(
    request: &SigningRequest<'_>,
    credentials: &Credentials,
    mut headers: Headers,
) -> Headers {
    headers.remove(AUTHORIZATION);
    let signature = signature(request, credentials, &headers);
    let value = format!(
        "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={signature}",
        credentials.access_key_id,
        request.scope(),
        signed_headers(&headers),
    );
    headers.insert(AUTHORIZATION.to_string(), value);
    headers
}

/// Hex signature over the request, ignoring any `authorization` header.
pub fn signature(
    request: &SigningRequest<'_>,
    credentials: &Credentials,
    headers: &Headers,
) -> String {
    let to_sign = string_to_sign(request, &canonical_request(request, headers));
    let key = signing_key(
        &credentials.secret_key,
        &request.date_stamp(),
        request.region,
        request.service,
    );
    hex::encode(hmac(&key, to_sign.as_bytes()))
}

/// Derives the per-day, per-region, per-service signing key.
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, TERMINATOR.as_bytes())
}

pub fn canonical_request(request: &SigningRequest<'_>, headers: &Headers) -> String {
    let headers = signable(headers);
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{}\n", canonical_header_value(value)))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        uri_encode(request.uri_path, false),
        canonical_query(request.query),
        canonical_headers,
        headers.keys().cloned().collect::<Vec<_>>().join(";"),
        hex_sha256(request.payload),
    )
}

pub fn string_to_sign(request: &SigningRequest<'_>, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{}\n{}\n{}",
        amz_date(request.timestamp),
        request.scope(),
        hex_sha256(canonical_request.as_bytes()),
    )
}

/// `;`-separated, sorted, lower-cased names of the headers that get signed.
pub fn signed_headers(headers: &Headers) -> String {
    signable(headers).keys().cloned().collect::<Vec<_>>().join(";")
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn signable(headers: &Headers) -> BTreeMap<String, &str> {
    headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(AUTHORIZATION))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect()
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// Trimmed, with inner runs of whitespace collapsed to one space.
fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (uri_encode(key, true), uri_encode(value, true))
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Everything except the SigV4 unreserved characters.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const UNRESERVED_AND_SLASH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Percent-encodes everything outside the SigV4 unreserved set. `/` is kept
/// unless `encode_slash` is set.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let set = if encode_slash {
        UNRESERVED
    } else {
        UNRESERVED_AND_SLASH
    };
    utf8_percent_encode(input, set).to_string()
}
