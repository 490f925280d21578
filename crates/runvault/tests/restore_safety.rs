//! Restore refuses unsafe, tampered or conflicting bundles and leaves no trace.

mod harness;

use harness::{read_entries, rewrite_archive, write_entries, TestHarness};
use runvault::bundle::{ManifestStatus, RestoreStatus, SignatureStatus};
use runvault::{RestoreOptions, RestoreReport};
use runvault_protocol::ErrorCode;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// A completed run exported from its own store, plus a fresh store to restore into.
fn exported() -> (TestHarness, String, PathBuf, TestHarness) {
    let source = TestHarness::new();
    let outcome = source.completed_run();
    let archive = source.export(&outcome.run_id);
    (source, outcome.run_id, archive, TestHarness::new())
}

fn assert_untouched(target: &TestHarness, run_id: &str) {
    assert!(!target.db.run_exists(run_id).unwrap());
    assert!(!target.artifacts.run_root("session-1", run_id).unwrap().exists());
    let staging = target.artifacts.data_root().join(".staging");
    if staging.exists() {
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }
}

/// 1-based position of `path` in the bundle manifest's file list.
fn manifest_position(archive: &Path, path: &str) -> usize {
    let manifest = read_entries(archive)
        .into_iter()
        .find(|(name, _)| name == "bundle_manifest.json")
        .map(|(_, bytes)| serde_json::from_slice::<Value>(&bytes).unwrap())
        .unwrap();
    let files = manifest["files"].as_array().unwrap();
    files
        .iter()
        .position(|f| f["relative_path"] == path)
        .map(|i| i + 1)
        .unwrap_or_else(|| panic!("{} not listed in manifest", path))
}

fn details(report: &RestoreReport) -> String {
    report.technical_details.clone().unwrap_or_default()
}

fn minimal_entries(extra: &[(&str, &[u8])]) -> Vec<(String, Vec<u8>)> {
    let mut entries = vec![
        (
            "run.json".to_string(),
            br#"{"run_id": "run-x", "session_id": "session-x", "status": "completed"}"#.to_vec(),
        ),
        ("logs/run.log".to_string(), b"log\n".to_vec()),
    ];
    for (name, bytes) in extra {
        entries.push((name.to_string(), bytes.to_vec()));
    }
    entries
}

#[test]
fn test_tampered_file_fails_integrity() {
    let (source, run_id, archive, target) = exported();
    let tampered = rewrite_archive(&archive, &source.scratch("tampered.zip"), |name, bytes| {
        if name == "run.json" {
            let text = String::from_utf8(bytes).unwrap().replace("openrouter", "openrouteR");
            Some(text.into_bytes())
        } else {
            Some(bytes)
        }
    });

    let report = target.restorer().restore(&tampered, &RestoreOptions::default());
    assert_eq!(report.status, RestoreStatus::Failed);
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert_eq!(report.manifest_verification_status, ManifestStatus::Failed);
    assert_eq!(report.files_checked, manifest_position(&tampered, "run.json"));
    assert!(details(&report).contains("sha256 does not match"), "{}", details(&report));
    assert!(details(&report).contains(&format!("files_checked={}", report.files_checked)));
    assert_eq!(
        report.error_message.as_deref(),
        Some(ErrorCode::RestoreInvalidArchive.friendly_message())
    );
    assert_untouched(&target, &run_id);
}

#[test]
fn test_tampering_first_listed_file_stops_at_one() {
    let (source, run_id, archive, target) = exported();
    let first = read_entries(&archive)
        .into_iter()
        .find(|(name, _)| name == "bundle_manifest.json")
        .map(|(_, bytes)| serde_json::from_slice::<Value>(&bytes).unwrap())
        .unwrap()["files"][0]["relative_path"]
        .as_str()
        .unwrap()
        .to_string();
    let tampered = rewrite_archive(&archive, &source.scratch("first-tampered.zip"), |name, mut bytes| {
        if name == first {
            assert!(!bytes.is_empty());
            bytes[0] ^= 0x01;
        }
        Some(bytes)
    });

    let report = target.restorer().restore(&tampered, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert_eq!(report.files_checked, 1);
    assert!(details(&report).contains(&first), "{}", details(&report));
    assert!(details(&report).contains("sha256 does not match"), "{}", details(&report));
    assert_untouched(&target, &run_id);
}

#[test]
fn test_unlisted_and_missing_files_fail_integrity() {
    let (source, run_id, archive, target) = exported();

    let extra = read_entries(&archive);
    let mut with_extra = extra.clone();
    with_extra.insert(0, ("llm/extra.txt".to_string(), b"smuggled".to_vec()));
    let path = source.scratch("extra.zip");
    write_entries(&path, &with_extra);
    let report = target.restorer().restore(&path, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("not listed"), "{}", details(&report));

    let missing = rewrite_archive(&archive, &source.scratch("missing.zip"), |name, bytes| {
        (name != "llm/response_raw.txt").then_some(bytes)
    });
    let report = target.restorer().restore(&missing, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("missing from archive"), "{}", details(&report));
    assert_untouched(&target, &run_id);
}

#[test]
fn test_high_compression_ratio_is_rejected() {
    let (source, run_id, archive, target) = exported();
    let zeros = vec![0u8; 200 * 1024];
    let bomb = source.scratch("bomb.zip");
    let mut entries = read_entries(&archive);
    entries.insert(0, ("logs/padding.log".to_string(), zeros));
    write_entries(&bomb, &entries);

    let report = target.restorer().restore(&bomb, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("max_compression_ratio"), "{}", details(&report));
    assert_eq!(report.manifest_verification_status, ManifestStatus::NotChecked);
    assert_untouched(&target, &run_id);
}

#[test]
fn test_entry_count_and_size_limits() {
    let (_source, run_id, archive, _) = exported();

    let few = TestHarness::with_config(|c| c.restore_limits.max_entries = 3);
    let report = few.restorer().restore(&archive, &RestoreOptions::default());
    assert!(details(&report).contains("too many entries"), "{}", details(&report));

    let small = TestHarness::with_config(|c| c.restore_limits.max_single_file_bytes = 16);
    let report = small.restorer().restore(&archive, &RestoreOptions::default());
    assert!(details(&report).contains("max_single_file_bytes"), "{}", details(&report));

    let tight = TestHarness::with_config(|c| c.restore_limits.max_total_uncompressed_bytes = 64);
    let report = tight.restorer().restore(&archive, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("uncompressed size"), "{}", details(&report));

    for harness in [few, small, tight] {
        assert_untouched(&harness, &run_id);
    }
}

#[test]
fn test_traversal_and_absolute_entries_are_rejected() {
    let target = TestHarness::new();
    for bad in ["../evil.txt", "logs/../../evil.txt", "/abs/evil.txt"] {
        let path = target.scratch("traversal.zip");
        write_entries(&path, &minimal_entries(&[(bad, b"evil")]));
        let report = target.restorer().restore(&path, &RestoreOptions::default());
        assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive), "{}", bad);
        assert!(details(&report).contains("invalid path"), "{}: {}", bad, details(&report));
    }
    assert!(!target.temp.path().join("evil.txt").exists());
    assert_untouched(&target, "run-x");
}

#[test]
fn test_symlink_entry_is_rejected() {
    let target = TestHarness::new();
    let path = target.scratch("symlink.zip");
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let options = SimpleFileOptions::default();
    for (name, bytes) in minimal_entries(&[]) {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(&bytes).unwrap();
    }
    zip.add_symlink("logs/passwd", "/etc/passwd", options).unwrap();
    zip.finish().unwrap();

    let report = target.restorer().restore(&path, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("symlink"), "{}", details(&report));
    assert_untouched(&target, "run-x");
}

#[test]
fn test_structural_checks() {
    let target = TestHarness::new();

    let no_manifest = target.scratch("no_run_json.zip");
    write_entries(&no_manifest, &[("logs/run.log".to_string(), b"log".to_vec())]);
    let report = target.restorer().restore(&no_manifest, &RestoreOptions::default());
    assert!(details(&report).contains("does not contain run.json"), "{}", details(&report));

    let no_layout = target.scratch("no_layout.zip");
    write_entries(
        &no_layout,
        &[(
            "run.json".to_string(),
            br#"{"run_id": "run-x", "session_id": "session-x"}"#.to_vec(),
        )],
    );
    let report = target.restorer().restore(&no_layout, &RestoreOptions::default());
    assert!(details(&report).contains("layout root"), "{}", details(&report));

    let bad_identity = target.scratch("bad_identity.zip");
    let mut entries = minimal_entries(&[]);
    entries[0].1 = br#"{"run_id": "", "session_id": "session-x"}"#.to_vec();
    write_entries(&bad_identity, &entries);
    let report = target.restorer().restore(&bad_identity, &RestoreOptions::default());
    assert!(details(&report).contains("non-empty session_id and run_id"), "{}", details(&report));

    let not_zip = target.scratch("not_a.zip");
    fs::write(&not_zip, b"definitely not a zip").unwrap();
    let report = target.restorer().restore(&not_zip, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));

    let report = target
        .restorer()
        .restore(&target.scratch("absent.zip"), &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("not found"));
}

#[test]
fn test_manifest_identity_must_match_run_json() {
    let (source, run_id, archive, target) = exported();
    let mismatched = rewrite_archive(&archive, &source.scratch("mismatch.zip"), |name, bytes| {
        if name == "bundle_manifest.json" {
            let mut manifest: Value = serde_json::from_slice(&bytes).unwrap();
            manifest["run_id"] = Value::String("someone-else".to_string());
            Some(serde_json::to_vec_pretty(&manifest).unwrap())
        } else {
            Some(bytes)
        }
    });
    let report = target.restorer().restore(&mismatched, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidArchive));
    assert!(details(&report).contains("run_id does not match"), "{}", details(&report));
    assert_untouched(&target, &run_id);
}

#[test]
fn test_flipped_signature_strict_and_lenient() {
    let key = |c: &mut runvault_protocol::RunvaultConfig| c.signing_key = Some("k3y".to_string());
    let source = TestHarness::with_config(key);
    let outcome = source.completed_run();
    let archive = source.export(&outcome.run_id);
    let flipped = rewrite_archive(&archive, &source.scratch("flipped.zip"), |name, bytes| {
        if name != "bundle_manifest.json" {
            return Some(bytes);
        }
        let mut manifest: Value = serde_json::from_slice(&bytes).unwrap();
        let digest = manifest["signature"]["hmac_sha256"].as_str().unwrap().to_string();
        let first = if digest.starts_with('0') { "1" } else { "0" };
        manifest["signature"]["hmac_sha256"] = Value::String(format!("{}{}", first, &digest[1..]));
        Some(serde_json::to_vec_pretty(&manifest).unwrap())
    });

    let strict = TestHarness::with_config(key);
    let report = strict.restorer().restore(
        &flipped,
        &RestoreOptions {
            require_signature: Some(true),
            ..RestoreOptions::default()
        },
    );
    assert_eq!(report.status, RestoreStatus::Failed);
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidSignature));
    assert_eq!(report.signature_verification_status, SignatureStatus::Failed);
    assert_eq!(report.manifest_verification_status, ManifestStatus::Verified);
    assert!(details(&report).contains("signature mismatch"), "{}", details(&report));
    assert_untouched(&strict, &outcome.run_id);

    let lenient = TestHarness::with_config(key);
    let report = lenient.restorer().restore(&flipped, &RestoreOptions::default());
    assert_eq!(report.status, RestoreStatus::Restored, "{:?}", report);
    assert_eq!(report.signature_verification_status, SignatureStatus::InvalidIgnored);
    assert!(report.warnings.iter().any(|w| w.contains("signature is invalid")));

    let configured_strict = TestHarness::with_config(|c| {
        c.signing_key = Some("k3y".to_string());
        c.require_signature = true;
    });
    let report = configured_strict.restorer().restore(&flipped, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreInvalidSignature));
    assert!(report.signature_required);
}

#[test]
fn test_existing_run_requires_overwrite() {
    let harness = TestHarness::new();
    let outcome = harness.completed_run();
    let archive = harness.export(&outcome.run_id);
    let root = harness.artifacts.run_root("session-1", &outcome.run_id).unwrap();
    let before = root.read_bytes("run.json").unwrap();

    let report = harness.restorer().restore(&archive, &RestoreOptions::default());
    assert_eq!(report.error_code, Some(ErrorCode::RestoreRunExists));
    assert!(details(&report).starts_with(&format!("Run already exists: {}", outcome.run_id)));
    assert!(report.restored_paths.is_empty());
    assert_eq!(root.read_bytes("run.json").unwrap(), before);
    assert!(harness.db.run_exists(&outcome.run_id).unwrap());
}

#[test]
fn test_failed_overwrite_keeps_existing_run() {
    let harness = TestHarness::new();
    let run_id = harness.completed_run().run_id;
    let archive = harness.export(&run_id);
    let root = harness.artifacts.run_root("session-1", &run_id).unwrap();
    let before = root.read_bytes("run.json").unwrap();
    let documents = harness.db.list_documents(&run_id).unwrap().len();
    let staging = harness.artifacts.data_root().join(".staging");
    assert!(!staging.exists());
    fs::write(&staging, b"not a directory").unwrap();

    let report = harness.restorer().restore(
        &archive,
        &RestoreOptions {
            overwrite_existing: true,
            ..RestoreOptions::default()
        },
    );
    assert_eq!(report.status, RestoreStatus::Failed);
    assert_eq!(report.error_code, Some(ErrorCode::RestoreFsError));
    assert!(details(&report).contains("staging"), "{}", details(&report));
    assert!(report.restored_paths.is_empty());

    assert!(harness.db.run_exists(&run_id).unwrap());
    assert_eq!(harness.db.list_documents(&run_id).unwrap().len(), documents);
    assert_eq!(root.read_bytes("run.json").unwrap(), before);
}

#[test]
fn test_metadata_failure_rolls_back_restored_tree() {
    let (_source, run_id, archive, target) = exported();
    target
        .raw_connection()
        .execute_batch("DROP TABLE artifact_refs;")
        .unwrap();

    let report = target.restorer().restore(&archive, &RestoreOptions::default());
    assert_eq!(report.status, RestoreStatus::Failed);
    assert_eq!(report.error_code, Some(ErrorCode::RestoreDbError));
    assert!(report.rollback_attempted);
    assert_eq!(report.rollback_succeeded, Some(true));
    assert!(report.restored_paths.is_empty());
    assert_untouched(&target, &run_id);
}

#[test]
fn test_metadata_failure_without_rollback_keeps_files() {
    let (_source, run_id, archive, target) = exported();
    target
        .raw_connection()
        .execute_batch("DROP TABLE artifact_refs;")
        .unwrap();

    let report = target.restorer().restore(
        &archive,
        &RestoreOptions {
            rollback_on_metadata_failure: false,
            ..RestoreOptions::default()
        },
    );
    assert_eq!(report.error_code, Some(ErrorCode::RestoreDbError));
    assert!(!report.rollback_attempted);
    assert!(report.rollback_succeeded.is_none());
    assert!(report.warnings.iter().any(|w| w.contains("Rollback disabled")));
    let root = target.artifacts.run_root("session-1", &run_id).unwrap();
    assert!(root.is_file("run.json"));
    assert!(!target.db.run_exists(&run_id).unwrap());
}
