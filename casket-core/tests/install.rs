mod common;

use std::fs;

use casket_common::error::CasketError;
use casket_common::model::{Action, ActionLog};
use casket_common::pipeline::PipelineEvent;
use casket_core::{ActionLogStore, InstallOptions, InstallOutcome};
use serde_json::{json, Value};

use common::{descriptor, Sandbox};

const APP_ENTRIES: &[(&str, &str)] = &[
    ("Foo.app/Contents/Info.plist", "<plist>foo 1.0</plist>"),
    ("Foo.app/Contents/MacOS/foo", "#!/bin/sh\necho foo\n"),
    ("bin/foo", "#!/bin/sh\necho cli\n"),
    ("Picker.colorPicker/Contents/Info.plist", "<plist>picker</plist>"),
    ("Foo.pkg", "xar!"),
];

fn cask(sha256: &str, artifacts: Value) -> Value {
    json!({
        "token": "foo",
        "name": ["Foo"],
        "version": "1.0",
        "sha256": sha256,
        "url": "https://example.com/foo-#{version}.zip",
        "artifacts": artifacts,
    })
}

fn install_opts(force: bool) -> InstallOptions {
    InstallOptions {
        force,
        ..Default::default()
    }
}

#[tokio::test]
async fn installs_app_binary_and_colorpicker() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"app": "Foo.app"}, {"binary": "bin/foo"}, {"colorpicker": "Picker.colorPicker"}]),
    ))]);

    let outcome = engine.install("foo", InstallOptions::default()).await.unwrap();
    assert!(matches!(
        outcome,
        InstallOutcome::Installed { unverified: false, .. }
    ));

    assert_eq!(
        fs::read_to_string(sandbox.path("Applications/Foo.app/Contents/Info.plist")).unwrap(),
        "<plist>foo 1.0</plist>"
    );
    let link = sandbox.path("bin/foo");
    assert_eq!(
        fs::read_link(&link).unwrap(),
        sandbox.path("Caskroom/foo/1.0/foo")
    );
    assert!(sandbox
        .path("home/Library/ColorPickers/Picker.colorPicker")
        .is_dir());

    let logs = engine.installed().unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_complete());
    assert!(logs[0]
        .entries
        .iter()
        .any(|e| matches!(&e.action, Action::Symlink { link: l, .. } if *l == link)));
}

#[tokio::test]
async fn disabled_cask_is_blocked_before_download() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut value = cask(&sha, json!([{"app": "Foo.app"}]));
    value["disabled"] = json!({"date": "2020-01-01", "because": "discontinued"});
    let engine = sandbox.engine(vec![descriptor(value)]);
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::LifecycleBlocked { .. }));
    assert_eq!(err.exit_code(), 10);
    assert_eq!(sandbox.source.calls(), 0);
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn future_dated_disable_blocks_too() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut value = cask(&sha, json!([{"app": "Foo.app"}]));
    value["disabled"] = json!({"date": "2999-01-01", "because": "is 32-bit only"});
    let engine = sandbox.engine(vec![descriptor(value)]);
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::LifecycleBlocked { .. }));
    assert!(err.to_string().contains("effective 2999-01-01"));
    assert_eq!(sandbox.source.calls(), 0);
    assert!(matches!(
        engine.verify("foo").await,
        Err(CasketError::LifecycleBlocked { .. })
    ));
    assert_eq!(sandbox.source.calls(), 0);
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn every_failed_install_is_announced_once() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut value = cask(&sha, json!([{"app": "Foo.app"}]));
    value["disabled"] = json!({"date": "2020-01-01", "because": "discontinued"});
    let engine = sandbox.engine(vec![descriptor(value)]);
    let mut events = engine.subscribe();

    assert!(engine.install("foo", InstallOptions::default()).await.is_err());
    assert!(engine.install("nope", InstallOptions::default()).await.is_err());

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::TransactionFailed { token, .. } = event {
            failed.push(token);
        }
    }
    assert_eq!(failed, vec!["foo".to_string(), "nope".to_string()]);
}

#[tokio::test]
async fn deprecated_cask_installs_with_a_warning() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut value = cask(&sha, json!([{"app": "Foo.app"}]));
    value["deprecated"] = json!({"date": "2020-01-01", "because": "unmaintained"});
    let engine = sandbox.engine(vec![descriptor(value)]);

    match engine.install("foo", InstallOptions::default()).await.unwrap() {
        InstallOutcome::Installed { warnings, .. } => {
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].contains("deprecated"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn manual_review_needs_explicit_override() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut value = cask(&sha, json!([{"app": "Foo.app"}]));
    value["no_autobump"] = json!({"because": "requires_manual_review"});
    let engine = sandbox.engine(vec![descriptor(value)]);

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::LifecycleBlocked { .. }));
    assert_eq!(sandbox.source.calls(), 0);

    let opts = InstallOptions {
        allow_manual_review: true,
        ..Default::default()
    };
    assert!(matches!(
        engine.install("foo", opts).await.unwrap(),
        InstallOutcome::Installed { .. }
    ));
}

#[tokio::test]
async fn checksum_mismatch_discards_download_and_changes_nothing() {
    let sandbox = Sandbox::new();
    sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let wrong = "0".repeat(64);
    let engine = sandbox.engine(vec![descriptor(cask(&wrong, json!([{"app": "Foo.app"}])))]);
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::ChecksumMismatch { .. }));
    assert_eq!(err.exit_code(), 11);
    assert_eq!(sandbox.snapshot(), before);
    assert_eq!(
        fs::read_dir(sandbox.config.downloads_dir()).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn second_install_is_a_no_op() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"app": "Foo.app"}, {"binary": "bin/foo"}]),
    ))]);

    engine.install("foo", InstallOptions::default()).await.unwrap();
    let entries = engine.installed().unwrap()[0].entries.len();
    let after_first = sandbox.snapshot();

    let outcome = engine.install("foo", install_opts(true)).await.unwrap();
    assert_eq!(
        outcome,
        InstallOutcome::AlreadyInstalled {
            token: "foo".into(),
            version: "1.0".into()
        }
    );
    assert_eq!(sandbox.source.calls(), 1);
    assert_eq!(engine.installed().unwrap()[0].entries.len(), entries);
    assert_eq!(sandbox.snapshot(), after_first);
}

#[tokio::test]
async fn failure_at_any_step_restores_prior_state() {
    let steps = [
        json!({"app": "Foo.app"}),
        json!({"binary": "bin/foo"}),
        json!({"colorpicker": "Picker.colorPicker"}),
    ];
    for failing in 0..=steps.len() {
        let sandbox = Sandbox::new();
        let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
        let mut artifacts: Vec<Value> = steps.to_vec();
        artifacts.insert(failing, json!({"app": "Missing.app"}));
        let engine = sandbox.engine(vec![descriptor(cask(&sha, Value::Array(artifacts)))]);
        let before = sandbox.snapshot();

        let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
        match &err {
            CasketError::Install { step_index, .. } => assert_eq!(*step_index, failing),
            other => panic!("step {failing}: unexpected error {other}"),
        }
        assert_eq!(err.exit_code(), 13);
        assert_eq!(sandbox.snapshot(), before, "leftovers after failing at {failing}");
        assert!(engine.installed().unwrap().is_empty());
    }
}

#[tokio::test]
async fn existing_target_is_kept_without_force() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(&sha, json!([{"app": "Foo.app"}])))]);
    fs::create_dir_all(sandbox.path("Applications/Foo.app")).unwrap();
    fs::write(sandbox.path("Applications/Foo.app/old"), "old").unwrap();
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::Install { step_index: 0, .. }));
    assert!(err.to_string().contains("--force"));
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn forced_install_restores_displaced_target_on_failure() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"app": "Foo.app"}, {"app": "Missing.app"}]),
    ))]);
    fs::create_dir_all(sandbox.path("Applications/Foo.app")).unwrap();
    fs::write(sandbox.path("Applications/Foo.app/old"), "old").unwrap();
    let before = sandbox.snapshot();

    let err = engine.install("foo", install_opts(true)).await.unwrap_err();
    assert!(matches!(err, CasketError::Install { step_index: 1, .. }));
    assert_eq!(sandbox.snapshot(), before);
    assert!(!sandbox.path("tmp/backup/foo").exists());
}

#[tokio::test]
async fn forced_install_discards_backup_on_success() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(&sha, json!([{"app": "Foo.app"}])))]);
    fs::create_dir_all(sandbox.path("Applications/Foo.app")).unwrap();
    fs::write(sandbox.path("Applications/Foo.app/old"), "old").unwrap();

    engine.install("foo", install_opts(true)).await.unwrap();
    assert!(!sandbox.path("Applications/Foo.app/old").exists());
    assert!(sandbox.path("Applications/Foo.app/Contents/Info.plist").exists());
    assert!(!sandbox.path("tmp/backup/foo").exists());

    // A completed log no longer points at the discarded backup.
    let log = &engine.installed().unwrap()[0];
    assert!(log.entries.iter().all(|e| match &e.action {
        Action::CopyBundle { backup, .. } => backup.is_none(),
        _ => true,
    }));
}

#[tokio::test]
async fn no_check_installs_are_marked_unverified() {
    let sandbox = Sandbox::new();
    sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask("no_check", json!([{"app": "Foo.app"}])))]);

    let outcome = engine.install("foo", InstallOptions::default()).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { unverified: true, .. }));
    assert!(engine.installed().unwrap()[0].unverified);
}

#[tokio::test]
async fn required_checksum_rejects_no_check() {
    let sandbox = Sandbox::new();
    sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let mut config = sandbox.config.clone();
    config.require_checksum = true;
    let engine = sandbox.engine_with(
        config,
        vec![descriptor(cask("no_check", json!([{"app": "Foo.app"}])))],
    );

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::Validation(_)));
    assert_eq!(sandbox.source.calls(), 0);
}

#[tokio::test]
async fn unfinished_log_is_rolled_back_before_reinstalling() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(&sha, json!([{"app": "Foo.app"}])))]);

    // An interrupted run got as far as copying a partial bundle.
    let target = sandbox.path("Applications/Foo.app");
    fs::create_dir_all(&target).unwrap();
    fs::write(target.join("partial"), "half").unwrap();
    let mut log = ActionLog::new("foo", "1.0", false);
    log.record(
        0,
        "app",
        Action::CopyBundle {
            source: sandbox.path("tmp/stage/gone/Foo.app"),
            target: target.clone(),
            backup: None,
        },
    );
    ActionLogStore::new(&sandbox.config).unwrap().save(&log).unwrap();

    let outcome = engine.install("foo", InstallOptions::default()).await.unwrap();
    assert!(matches!(outcome, InstallOutcome::Installed { .. }));
    assert!(!target.join("partial").exists());
    assert!(target.join("Contents/Info.plist").exists());
    assert!(engine.installed().unwrap()[0].is_complete());
}

#[tokio::test]
async fn cancellation_rolls_back_and_reports_cancelled() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"app": "Foo.app"}, {"pkg": "Foo.pkg"}, {"binary": "bin/foo"}]),
    ))]);
    sandbox.runner.pkg_registers("com.example.foo");
    sandbox
        .runner
        .cancel_after("installer", engine.cancellation_token());
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::Cancelled(_)));
    assert_eq!(err.exit_code(), 18);
    assert_eq!(sandbox.snapshot(), before);
    assert!(sandbox.runner.receipts().is_empty());
    assert!(!sandbox.path("bin/foo").exists());
}

#[tokio::test]
async fn failed_pkg_install_forgets_new_receipts() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"pkg": {"path": "Foo.pkg", "allow_untrusted": true}}, {"app": "Missing.app"}]),
    ))]);
    sandbox.runner.pkg_registers("com.example.foo");

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::Install { step_index: 1, .. }));
    assert!(sandbox.runner.receipts().is_empty());

    let installer = &sandbox.runner.program_calls("installer")[0];
    assert!(installer.elevate);
    assert!(installer.args.iter().any(|a| a == "-allowUntrusted"));
    let forgets: Vec<_> = sandbox
        .runner
        .program_calls("pkgutil")
        .into_iter()
        .filter(|c| c.args.first().is_some_and(|a| a == "--forget"))
        .collect();
    assert_eq!(forgets.len(), 1);
    assert!(forgets[0].elevate);
}

#[tokio::test]
async fn script_installer_without_uninstaller_leaves_unclean_state() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let setup = sandbox.script("setup.sh", "touch \"$1\"");
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([
            {"installer": {"script": {"executable": setup, "args": ["#{staged_path}/setup-ran"]}}},
            {"app": "Missing.app"}
        ]),
    ))]);

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::UncleanState { .. }));
    assert_eq!(err.exit_code(), 16);
    // The in-progress log stays so the rollback can be finished later.
    let logs = engine.installed().unwrap();
    assert_eq!(logs.len(), 1);
    assert!(!logs[0].is_complete());
}

#[tokio::test]
async fn script_installer_is_undone_by_declared_uninstaller() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let marker = sandbox.fixtures.path().join("setup-ran");
    let setup = sandbox.script("setup.sh", "touch \"$1\"");
    let teardown = sandbox.script("teardown.sh", "rm -f \"$1\"");
    let mut value = cask(
        &sha,
        json!([
            {"installer": {"script": {"executable": setup, "args": [marker]}}},
            {"app": "Missing.app"}
        ]),
    );
    value["uninstall"] = json!([{"script": {"executable": teardown, "args": [marker]}}]);
    let engine = sandbox.engine(vec![descriptor(value)]);
    let before = sandbox.snapshot();

    let err = engine.install("foo", InstallOptions::default()).await.unwrap_err();
    assert!(matches!(err, CasketError::Install { step_index: 1, .. }));
    assert!(!marker.exists());
    assert_eq!(sandbox.snapshot(), before);
}

#[tokio::test]
async fn manual_installer_is_kept_with_a_caveat() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(
        &sha,
        json!([{"installer": {"manual": "Foo.pkg"}}]),
    ))]);

    match engine.install("foo", InstallOptions::default()).await.unwrap() {
        InstallOutcome::Installed { caveats, .. } => {
            assert!(caveats.unwrap().contains("Caskroom/foo/1.0/Foo.pkg"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(sandbox.path("Caskroom/foo/1.0/Foo.pkg").exists());
}

#[tokio::test]
async fn verify_reports_checksum_state_without_installing() {
    let sandbox = Sandbox::new();
    let sha = sandbox.zip_artifact("foo", "Foo.zip", APP_ENTRIES);
    let engine = sandbox.engine(vec![descriptor(cask(&sha, json!([{"app": "Foo.app"}])))]);

    assert!(engine.verify("foo").await.unwrap().is_verified());
    assert!(engine.installed().unwrap().is_empty());
    assert!(!sandbox.path("Applications").exists());
}
