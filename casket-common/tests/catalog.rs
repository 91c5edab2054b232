use std::fs;

use casket_common::error::CasketError;
use casket_common::model::{InstallStep, LifecycleReason};
use casket_common::Catalog;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, body: &str) {
    fs::write(dir.path().join(name), body).unwrap();
}

#[test]
fn loads_single_and_list_files() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "shimeike-formulatepro.json",
        r#"{
            "token": "shimeike-formulatepro",
            "name": ["FormulatePro"],
            "version": "0.0.6-alpha",
            "sha256": "8e4ab7e7f6f85e0aa8c4a3ae63dd6d3c20b3bd2ea9a5c24b0fb6d1a44c1c0f3f",
            "url": "https://example.com/FormulatePro-#{version}.zip",
            "artifacts": [{"app": "FormulatePro.app"}],
            "disabled": {"date": "2024-07-17", "because": "is 32-bit only"}
        }"#,
    );
    write(
        &dir,
        "more.json",
        r#"{"casks": [
            {"token": "alpha", "version": "1.0", "sha256": "no_check", "url": "https://e.com/a.zip"},
            {"token": "beta"}
        ]}"#,
    );
    write(&dir, "README.txt", "not a descriptor");

    let catalog = Catalog::load(dir.path()).unwrap();
    assert_eq!(catalog.len(), 3);
    assert!(catalog.rejected().is_empty());

    let fp = catalog.get("shimeike-formulatepro").unwrap();
    assert!(matches!(fp.artifacts[0], InstallStep::App(_)));
    assert_eq!(
        fp.disabled.as_ref().unwrap().because,
        LifecycleReason::Other("is 32-bit only".into())
    );
}

#[test]
fn invalid_files_are_rejected_not_fatal() {
    let dir = TempDir::new().unwrap();
    write(&dir, "broken.json", "{ not json");
    write(&dir, "unpaired.json", r#"{"token": "x", "version": "1.0"}"#);
    write(&dir, "good.json", r#"{"token": "good"}"#);

    let catalog = Catalog::load(dir.path()).unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog.rejected().len(), 2);
}

#[test]
fn missing_token_is_not_found() {
    let catalog = Catalog::load(&std::env::temp_dir().join("casket-no-such-catalog")).unwrap();
    assert!(catalog.is_empty());
    assert!(matches!(
        catalog.get("nope"),
        Err(CasketError::NotFound(_))
    ));
}
