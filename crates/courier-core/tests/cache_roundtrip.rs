//! End-to-end cache tests: sign, render, parse, verify, index.

use std::io::Write;

use courier_core::cache::{CacheError, ServiceCache};
use courier_core::crypto::load_signing_key;
use courier_core::record::{
    ActionRecord, ClassRecord, ClassRecords, RECORD_SEPARATOR, RecordError, render_signed_record,
};
use tempfile::NamedTempFile;

const SERVICE_KEY_PEM: &str = include_str!("fixtures/service.key");
const SERVICE_CERT_PEM: &str = include_str!("fixtures/service.crt");

fn class_records(ident: &str, class: &str, action: &str) -> ClassRecords {
    ClassRecords {
        version: 3,
        ident: ident.to_string(),
        sector: "main".to_string(),
        weight: 1,
        announce_interval: 15,
        connspec: "127.0.0.1:30100".to_string(),
        protocols: vec!["json".to_string()],
        classes: vec![ClassRecord {
            name: class.to_string(),
            actions: vec![ActionRecord {
                name: action.to_string(),
                crud_tags: "read".to_string(),
                version: 1,
            }],
        }],
    }
}

fn render_cache_file(records: &[ClassRecords]) -> String {
    let key = load_signing_key(SERVICE_KEY_PEM).unwrap();
    let mut out = String::new();
    for record in records {
        out.push_str(RECORD_SEPARATOR);
        out.push('\n');
        out.push_str(&render_signed_record(record, SERVICE_CERT_PEM, &key).unwrap());
    }
    out
}

/// Flips the first character of the base64 signature in `contents`.
fn corrupt_signature(contents: &mut String) {
    const CERT_TRAILER: &str = "-----END CERTIFICATE-----";
    let trailer = contents.find(CERT_TRAILER).expect("certificate trailer");
    let sig_start = trailer + CERT_TRAILER.len() + 2; // skip "\n\n"
    let original = contents.as_bytes()[sig_start] as char;
    let replacement = if original == 'B' { "C" } else { "B" };
    contents.replace_range(sig_start..=sig_start, replacement);
}

#[test]
fn signed_records_roundtrip_through_the_cache() {
    let file_contents = render_cache_file(&[
        class_records("svc-1", "Cls", "do"),
        class_records("svc-2", "Other", "run"),
    ]);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(file_contents.as_bytes()).unwrap();

    let cache = ServiceCache::new(file.path());
    cache.refresh().unwrap();

    assert_eq!(cache.size(), 2);

    let proxy = cache.retrieve("svc-1").expect("svc-1 indexed");
    proxy.validate().expect("signature verifies");
    assert_eq!(proxy.connspec(), "127.0.0.1:30100");

    assert!(cache.retrieve("svc-2").is_some());

    let hits = cache.search_by_action("main", "Cls.do", 1, "json");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ident(), "svc-1");

    let hits = cache.search_by_action("main", "Other.run", 1, "json");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ident(), "svc-2");
}

#[test]
fn corrupted_signature_drops_the_proxy() {
    let mut contents = render_cache_file(&[class_records("svc-1", "Cls", "do")]);
    corrupt_signature(&mut contents);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();

    let cache = ServiceCache::new(file.path());
    cache.refresh().unwrap();
    assert_eq!(cache.size(), 0, "tampered record must not be indexed");
}

#[test]
fn verification_disabled_indexes_corrupted_records() {
    let mut contents = render_cache_file(&[class_records("svc-1", "Cls", "do")]);
    corrupt_signature(&mut contents);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();

    let mut cache = ServiceCache::new(file.path());
    cache.disable_record_verification();
    cache.refresh().unwrap();

    assert_eq!(cache.size(), 1);
    let proxy = cache.retrieve("svc-1").unwrap();
    assert!(proxy.validate().is_err(), "signature is genuinely corrupt");
}

#[test]
fn refresh_replaces_prior_contents() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(
        file.path(),
        render_cache_file(&[class_records("svc-a", "Cls", "do")]),
    )
    .unwrap();

    let cache = ServiceCache::new(file.path());
    cache.refresh().unwrap();
    assert!(cache.retrieve("svc-a").is_some());

    std::fs::write(
        file.path(),
        render_cache_file(&[class_records("svc-b", "Cls", "do")]),
    )
    .unwrap();
    cache.refresh().unwrap();

    assert!(cache.retrieve("svc-a").is_none());
    assert!(cache.retrieve("svc-b").is_some());
    assert_eq!(cache.size(), 1);
}

#[test]
fn malformed_refresh_retains_prior_indexes() {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(
        file.path(),
        render_cache_file(&[class_records("svc-a", "Cls", "do")]),
    )
    .unwrap();

    let cache = ServiceCache::new(file.path());
    cache.refresh().unwrap();
    assert_eq!(cache.size(), 1);

    // A separator followed by a class line with no blank line after it.
    std::fs::write(file.path(), "%%%\n{}\nnot-a-blank-line\n").unwrap();
    let err = cache.refresh().unwrap_err();
    assert!(matches!(
        err,
        CacheError::Record(RecordError::Malformed { .. })
    ));

    assert_eq!(cache.size(), 1, "failed reload must not clear the cache");
    assert!(cache.retrieve("svc-a").is_some());
}
