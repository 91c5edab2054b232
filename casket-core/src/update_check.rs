// casket-core/src/update_check.rs
use std::sync::Arc;

use async_trait::async_trait;
use casket_common::catalog::Catalog;
use casket_common::error::Result;
use casket_common::model::{ActionLog, Descriptor};
use tracing::{debug, warn};

/// Looks up the newest upstream version of a descriptor, typically by
/// following its `livecheck` rule.
#[async_trait]
pub trait VersionCheck: Send + Sync {
    /// `None` when the check has no opinion (no rule, nothing matched).
    async fn latest_version(&self, descriptor: &Descriptor) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Current,
    Stale { latest: String },
    Unknown,
}

/// Compares the catalog version of `descriptor` with what `check` reports upstream.
pub async fn descriptor_staleness(descriptor: &Descriptor, check: &dyn VersionCheck) -> Staleness {
    if descriptor.is_unversioned() {
        return Staleness::Unknown;
    }
    match check.latest_version(descriptor).await {
        Ok(Some(latest)) if latest == descriptor.effective_version() => Staleness::Current,
        Ok(Some(latest)) => {
            debug!(
                "{} is stale: catalog has {}, upstream has {}",
                descriptor.token,
                descriptor.effective_version(),
                latest
            );
            Staleness::Stale { latest }
        }
        Ok(None) => Staleness::Unknown,
        Err(e) => {
            warn!("Version check for {} failed: {}", descriptor.token, e);
            Staleness::Unknown
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub token: String,
    pub installed_version: String,
    pub available_version: String,
    pub descriptor: Arc<Descriptor>,
}

/// Installed casks whose catalog version differs from the installed one.
/// Casks that update themselves, and unversioned casks, are only reported
/// when `greedy` is set.
pub fn installed_updates(logs: &[ActionLog], catalog: &Catalog, greedy: bool) -> Vec<UpdateInfo> {
    let mut updates = Vec::new();
    for log in logs.iter().filter(|log| log.is_complete()) {
        let Ok(descriptor) = catalog.get(&log.token) else {
            warn!("Installed cask '{}' not found in the catalog.", log.token);
            continue;
        };
        if !greedy && (descriptor.auto_updates || descriptor.is_unversioned()) {
            debug!("Skipping {}: it updates itself", log.token);
            continue;
        }
        let available = descriptor.effective_version();
        if available != log.version || (greedy && descriptor.is_unversioned()) {
            debug!(
                "Update found for Cask {}: {} -> {}",
                log.token, log.version, available
            );
            updates.push(UpdateInfo {
                token: log.token.clone(),
                installed_version: log.version.clone(),
                available_version: available.to_string(),
                descriptor: descriptor.clone(),
            });
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use casket_common::error::CasketError;

    use super::*;

    fn descriptor(json: &str) -> Descriptor {
        serde_json::from_str(json).unwrap()
    }

    fn complete_log(token: &str, version: &str) -> ActionLog {
        let mut log = ActionLog::new(token, version, false);
        log.mark_complete();
        log
    }

    struct Fixed(Result<Option<String>>);

    #[async_trait]
    impl VersionCheck for Fixed {
        async fn latest_version(&self, _descriptor: &Descriptor) -> Result<Option<String>> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn staleness_against_upstream() {
        let d = descriptor(r#"{"token": "mplab-xc8", "version": "3.00", "sha256": "no_check"}"#);
        assert_eq!(
            descriptor_staleness(&d, &Fixed(Ok(Some("3.00".into())))).await,
            Staleness::Current
        );
        assert_eq!(
            descriptor_staleness(&d, &Fixed(Ok(Some("3.10".into())))).await,
            Staleness::Stale {
                latest: "3.10".into()
            }
        );
        assert_eq!(
            descriptor_staleness(&d, &Fixed(Err(CasketError::Generic("offline".into())))).await,
            Staleness::Unknown
        );
    }

    #[test]
    fn outdated_installs() {
        let catalog = Catalog::from_descriptors([
            descriptor(r#"{"token": "a", "version": "2.0", "sha256": "no_check"}"#),
            descriptor(r#"{"token": "b", "version": "1.0", "sha256": "no_check"}"#),
            descriptor(
                r#"{"token": "c", "version": "5.0", "sha256": "no_check", "auto_updates": true}"#,
            ),
        ])
        .unwrap();
        let logs = vec![
            complete_log("a", "1.0"),
            complete_log("b", "1.0"),
            complete_log("c", "4.0"),
            complete_log("gone", "1.0"),
            ActionLog::new("a", "1.5", false),
        ];

        let updates = installed_updates(&logs, &catalog, false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].token, "a");
        assert_eq!(updates[0].available_version, "2.0");

        let greedy: Vec<_> = installed_updates(&logs, &catalog, true)
            .into_iter()
            .map(|u| u.token)
            .collect();
        assert_eq!(greedy, vec!["a", "c"]);
    }
}
