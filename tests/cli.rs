use std::{
    path::Path,
    process::{Command, Output},
};

use segdex::{SegmentStore, indexer, schema::Schema, writer::Document};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn segdex(args: &[&str]) -> Result<Output, std::io::Error> {
    Command::new(env!("CARGO_BIN_EXE_segdex"))
        .args(args)
        .env("SEGDEX_LOG", "warn")
        .output()
}

fn setup_tenant(root: &Path, name: &str) -> TestResult {
    let store = SegmentStore::open(&root.join(name))?;
    let docs = vec![
        Document::new()
            .with("url", "/webhooks")
            .with("title", "Webhooks")
            .with("body", "Configure webhook retries."),
    ];
    indexer::index_documents(&store, Schema::documentation(), docs)?;
    Ok(())
}

#[test]
fn vacuum_missing_root_fails() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let missing = tmp.path().join("nope");

    let output = segdex(&["vacuum", missing.to_str().unwrap()])?;
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("root does not exist"), "{stderr}");
    Ok(())
}

#[test]
fn vacuum_dry_run_lists_without_changes() -> TestResult {
    let tmp = tempfile::tempdir()?;
    setup_tenant(tmp.path(), "acme")?;
    setup_tenant(tmp.path(), "globex")?;
    std::fs::create_dir(tmp.path().join("acme-scratch"))?;
    let before = SegmentStore::open(&tmp.path().join("acme"))?.list()?;

    let output = segdex(&[
        "vacuum",
        tmp.path().to_str().unwrap(),
        "--dry-run",
        "--tenant",
        "ac*",
    ])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("acme: 1 segment file(s)"), "{stdout}");
    assert!(!stdout.contains("globex"), "{stdout}");
    assert!(!stdout.contains("acme-scratch"), "{stdout}");

    let after = SegmentStore::open(&tmp.path().join("acme"))?.list()?;
    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].size_bytes, after[0].size_bytes);
    Ok(())
}

#[test]
fn vacuum_compacts_every_tenant() -> TestResult {
    let tmp = tempfile::tempdir()?;
    setup_tenant(tmp.path(), "acme")?;

    let output = segdex(&["vacuum", tmp.path().to_str().unwrap()])?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("vacuumed 1 file(s)"), "{stdout}");
    Ok(())
}

#[test]
fn index_then_search_json() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("docs.jsonl");
    std::fs::write(
        &input,
        concat!(
            r#"{"url":"/webhooks","title":"Webhooks","body":"Webhook retries use backoff."}"#,
            "\n",
            r#"{"url":"/oauth","title":"OAuth","body":"Exchange the code for a token."}"#,
            "\n",
        ),
    )?;
    let data_dir = tmp.path().join("data");
    let data_dir = data_dir.to_str().unwrap();

    let output = segdex(&[
        "--data-dir",
        data_dir,
        "index",
        "-t",
        "acme",
        "-i",
        input.to_str().unwrap(),
    ])?;
    assert!(output.status.success(), "{output:?}");

    let output = segdex(&[
        "--data-dir",
        data_dir,
        "search",
        "-t",
        "acme",
        "--json",
        "webhook retry",
    ])?;
    assert!(output.status.success(), "{output:?}");
    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(response["results"][0]["url"], "/webhooks");
    Ok(())
}

#[test]
fn config_set_rejects_invalid_values() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let data_dir = tmp.path().to_str().unwrap();

    let output =
        segdex(&["--data-dir", data_dir, "config", "set", "b", "2.0"])?;
    assert!(!output.status.success());

    let output =
        segdex(&["--data-dir", data_dir, "config", "set", "k1", "1.2"])?;
    assert!(output.status.success());
    let output = segdex(&["--data-dir", data_dir, "config", "get", "k1"])?;
    assert_eq!(String::from_utf8(output.stdout)?.trim(), "1.2");
    Ok(())
}
