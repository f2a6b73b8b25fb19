// Copyright 2025 casebox contributors.
// Licensed under the Apache License, Version 2.0.
use crate::status::{ExitStatus, MetaLog};

#[test]
fn parse_meta_log() {
    let log = MetaLog::parse(
        "exit-code: 0\ntime: 0.123\ntime-wall: 0.456\nmem: 2048\nfile: 12\n",
    );
    assert_eq!(log.get("exit-code"), Some("0"));
    assert_eq!(log.get_f64("time"), Some(0.123));
    assert_eq!(log.get_f64("time-wall"), Some(0.456));
    assert_eq!(log.get_i64("mem"), Some(2048));
    assert_eq!(log.get("missing"), None);
    assert!(log.status_list().is_empty());
    assert_eq!(log.exit_status(), ExitStatus::Ok);
}

#[test]
fn parse_skips_malformed_lines() {
    let log = MetaLog::parse("garbage\nexit-code: 1\n\n");
    assert_eq!(log.get_i64("exit-code"), Some(1));
}

#[test]
fn repeated_keys_are_kept() {
    let log = MetaLog::parse("status:RE\nstatus:SG\n");
    assert_eq!(log.get("status"), Some("RE"));
    assert_eq!(log.get_all("status"), &["RE".to_owned(), "SG".to_owned()]);
}

#[test]
fn status_precedence() {
    let cases = [
        ("RE", ExitStatus::NonzeroReturn),
        ("SG", ExitStatus::Signal),
        ("SG,RE", ExitStatus::Signal),
        ("TO", ExitStatus::Timeout),
        ("TO,SG", ExitStatus::Timeout),
        ("WT,TO", ExitStatus::WallTimeout),
        ("TO,WT", ExitStatus::WallTimeout),
        ("ML", ExitStatus::MemoryLimitExceeded),
        ("OL,ML", ExitStatus::OutputLimitExceeded),
        ("TO,OL", ExitStatus::Timeout),
    ];
    for (status, expected) in cases {
        let log = MetaLog::parse(&format!("status: {status}\n"));
        assert_eq!(log.exit_status(), expected, "status = {status}");
    }
}

#[test]
fn exit_status_wire_names() {
    assert_eq!(
        serde_json::to_string(&ExitStatus::WallTimeout).unwrap(),
        "\"wall-timeout\""
    );
    assert_eq!(
        serde_json::to_string(&ExitStatus::MemoryLimitExceeded).unwrap(),
        "\"memory-limit-exceeded\""
    );
    assert_eq!(ExitStatus::SandboxError.to_string(), "sandbox-error");
    assert_eq!(
        serde_json::from_str::<ExitStatus>("\"nonzero-return\"").unwrap(),
        ExitStatus::NonzeroReturn
    );
}
