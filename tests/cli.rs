//! CLI test cases.
//!
//! These only exercise commands which can run without AWS: offline payload
//! processing, schemas, and the in-memory job store.

use std::{fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// A one-page payload with two lines on the first row and one below.
static PAGE_FIXTURE: &str = "tests/fixtures/page.json";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("ocr-batcher").unwrap();
    // Keep a developer's `.env` or shell from changing our defaults.
    cmd.env_remove("OCR_BATCHER_JOB_STORE")
        .env_remove("OCR_BATCHER_BLOB_ROOT")
        .env_remove("OCR_BATCHER_SOURCE")
        .env_remove("OCR_BATCHER_OUTPUT");
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_text_reconstructs_reading_order() {
    cmd()
        .arg("text")
        .arg(PAGE_FIXTURE)
        .assert()
        .success()
        .stdout("Invoice\tTotal\t\nPaid\n");
}

#[test]
fn test_text_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("page.txt");
    cmd()
        .arg("text")
        .arg(PAGE_FIXTURE)
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&out).unwrap(), "Invoice\tTotal\t\nPaid\n");
}

#[test]
fn test_text_reads_blob_uri_from_blob_root() {
    let dir = tempfile::tempdir().unwrap();
    let container = dir.path().join("payloads").join("2024");
    fs::create_dir_all(&container).unwrap();
    fs::copy(PAGE_FIXTURE, container.join("page.json")).unwrap();
    cmd()
        .arg("text")
        .arg("s3://payloads/2024/page.json")
        .arg("--blob-root")
        .arg(dir.path())
        .assert()
        .success()
        .stdout("Invoice\tTotal\t\nPaid\n");
}

#[test]
fn test_text_rejects_malformed_payload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lines-only.json");
    fs::write(
        &path,
        r#"{"Blocks": [{"BlockType": "LINE", "Id": "l1", "Text": "orphan",
            "Geometry": {"BoundingBox": {"Width": 0.1, "Height": 0.1, "Left": 0.1, "Top": 0.1}}}]}"#,
    )
    .unwrap();
    cmd()
        .arg("text")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not reconstruct text"));
}

#[test]
fn test_metrics() {
    let output = cmd().arg("metrics").arg(PAGE_FIXTURE).output().unwrap();
    assert!(output.status.success());
    let metrics: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(metrics["blocks"], 7);
    assert_eq!(metrics["lines"], 3);
    assert_eq!(metrics["words"], 3);
    assert_eq!(metrics["characters"], 16);
    assert_eq!(metrics["tables"], 0);
    assert_eq!(metrics["forms"], 0);
    assert_eq!(metrics["pages"], 1);
    assert_eq!(metrics["shards"], 1);
    assert_eq!(metrics["size"], fs::metadata(PAGE_FIXTURE).unwrap().len());
}

#[test]
fn test_schema_job_record() {
    cmd()
        .arg("schema")
        .arg("JobRecord")
        .assert()
        .success()
        .stdout(predicate::str::contains("FAILED_CONVERT"))
        .stdout(predicate::str::contains("document_id"));
}

#[test]
fn test_schema_document_metrics() {
    cmd()
        .arg("schema")
        .arg("DocumentMetrics")
        .assert()
        .success()
        .stdout(predicate::str::contains("shards"));
}

#[test]
fn test_reset_requires_targets() {
    cmd()
        .arg("reset")
        .arg("--job-store")
        .arg("memory")
        .assert()
        .failure();
}

#[test]
fn test_reset_rejects_ids_with_all_failed() {
    cmd()
        .arg("reset")
        .arg("--job-store")
        .arg("memory")
        .arg("--all-failed")
        .arg("scans/a.pdf")
        .assert()
        .failure();
}

#[test]
fn test_status_with_empty_memory_store() {
    cmd()
        .arg("status")
        .arg("--job-store")
        .arg("memory")
        .assert()
        .success()
        .stdout(predicate::str::contains("PENDING"))
        .stdout(predicate::str::contains("TOTAL           0"));
}

#[test]
fn test_dynamodb_store_requires_table() {
    cmd()
        .arg("status")
        .arg("--job-store")
        .arg("dynamodb")
        .env_remove("OCR_BATCHER_JOB_TABLE")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--job-table"));
}

#[test]
fn test_rate_limit_is_validated() {
    cmd()
        .arg("submit")
        .arg("--job-store")
        .arg("memory")
        .arg("--ocr-rate-limit")
        .arg("0/s")
        .assert()
        .failure();
}
