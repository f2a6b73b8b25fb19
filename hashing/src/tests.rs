// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use crate::{digest_reader, Digester, Fingerprint};

#[test]
fn digest_known_values() {
    assert_eq!(
        Fingerprint::digest(b"").to_hex(),
        "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );
    assert_eq!(
        Fingerprint::digest(b"meep").to_hex(),
        "9478159bef3d3c6fe5c2fe084a74ce5e92b6c070"
    );
}

#[test]
fn hex_roundtrip() {
    let fingerprint = Fingerprint::digest(b"jelly");
    assert_eq!(
        Fingerprint::from_hex(&fingerprint.to_hex()).unwrap(),
        fingerprint
    );
    // Case-insensitive on the way in, lowercase on the way out.
    let upper = fingerprint.to_hex().to_uppercase();
    assert_eq!(Fingerprint::from_hex(&upper).unwrap(), fingerprint);
}

#[test]
fn from_hex_rejects_bad_input() {
    Fingerprint::from_hex("abcd").expect_err("too short");
    Fingerprint::from_hex("da39a3ee5e6b4b0d3255bfef95601890afd8070900").expect_err("too long");
    Fingerprint::from_hex("zz39a3ee5e6b4b0d3255bfef95601890afd80709").expect_err("not hex");
}

#[test]
fn display_and_parse() {
    let hex = "9478159bef3d3c6fe5c2fe084a74ce5e92b6c070";
    let fingerprint: Fingerprint = hex.parse().unwrap();
    assert_eq!(fingerprint.to_string(), hex);
    assert_eq!(format!("{fingerprint:?}"), format!("Fingerprint<{hex}>"));
}

#[test]
fn serde_as_hex_string() {
    let fingerprint = Fingerprint::digest(b"peanut butter");
    let encoded = serde_json::to_string(&fingerprint).unwrap();
    assert_eq!(encoded, format!("\"{}\"", fingerprint.to_hex()));
    let decoded: Fingerprint = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, fingerprint);
    assert!(serde_json::from_str::<Fingerprint>("\"nope\"").is_err());
}

#[test]
fn incremental_digest_matches_one_shot() {
    let mut digester = Digester::new();
    digester.update(b"peanut");
    digester.update(b" ");
    digester.update(b"butter");
    assert_eq!(digester.bytes_seen(), 13);
    assert_eq!(digester.finish(), Fingerprint::digest(b"peanut butter"));
}

#[test]
fn prefix_is_stable_and_spread() {
    let a = Fingerprint::digest(b"one");
    assert_eq!(a.prefix_u64(), a.prefix_u64());
    // Different content gives a different seed.
    assert_ne!(a.prefix_u64(), Fingerprint::digest(b"two").prefix_u64());
}

#[tokio::test]
async fn digest_reader_streams() {
    let mut reader: &[u8] = b"streamed content";
    let fingerprint = digest_reader(&mut reader).await.unwrap();
    assert_eq!(fingerprint, Fingerprint::digest(b"streamed content"));

    let mut empty: &[u8] = b"";
    assert_eq!(
        digest_reader(&mut empty).await.unwrap(),
        Fingerprint::digest(b"")
    );
}
