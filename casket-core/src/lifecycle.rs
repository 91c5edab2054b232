// casket-core/src/lifecycle.rs
use std::fmt;

use casket_common::error::{CasketError, Result};
use casket_common::model::{Descriptor, LifecycleFlag, LifecycleReason};
use chrono::NaiveDate;
use tracing::debug;

/// Caller-granted exceptions to the gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateOverrides {
    pub allow_manual_review: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Disabled {
        date: NaiveDate,
        reason: LifecycleReason,
        /// The date lies in the future; the descriptor is refused already.
        scheduled: bool,
    },
    ManualReview,
    /// A lifecycle date could not be interpreted.
    UnknownLifecycleState { field: &'static str, value: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Disabled {
                date,
                reason,
                scheduled: false,
            } => write!(f, "has been disabled because it {reason} (since {date})"),
            BlockReason::Disabled {
                date,
                reason,
                scheduled: true,
            } => write!(f, "is disabled because it {reason} (effective {date})"),
            BlockReason::ManualReview => f.write_str(
                "requires manual review before automated installation (pass --allow-manual-review)",
            ),
            BlockReason::UnknownLifecycleState { field, value } => {
                write!(f, "has an unreadable {field} date '{value}'")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed { warnings: Vec<String> },
    Blocked(BlockReason),
}

impl GateDecision {
    /// Warnings to surface on `Proceed`, `LifecycleBlocked` otherwise.
    pub fn into_result(self, token: &str) -> Result<Vec<String>> {
        match self {
            GateDecision::Proceed { warnings } => Ok(warnings),
            GateDecision::Blocked(reason) => Err(CasketError::LifecycleBlocked {
                token: token.to_string(),
                reason: reason.to_string(),
            }),
        }
    }
}

fn parse_flag(flag: &LifecycleFlag, field: &'static str) -> std::result::Result<NaiveDate, BlockReason> {
    flag.parsed_date()
        .ok_or_else(|| BlockReason::UnknownLifecycleState {
            field,
            value: flag.date.clone(),
        })
}

/// Decides whether `descriptor` may be fetched and installed on `today`.
pub fn evaluate(descriptor: &Descriptor, overrides: GateOverrides, today: NaiveDate) -> GateDecision {
    let mut warnings = Vec::new();

    if let Some(flag) = &descriptor.disabled {
        let date = match parse_flag(flag, "disabled") {
            Ok(date) => date,
            Err(reason) => return GateDecision::Blocked(reason),
        };
        debug!("{} is disabled ({})", descriptor.token, date);
        return GateDecision::Blocked(BlockReason::Disabled {
            date,
            reason: flag.because.clone(),
            scheduled: date > today,
        });
    }

    if let Some(flag) = &descriptor.deprecated {
        let date = match parse_flag(flag, "deprecated") {
            Ok(date) => date,
            Err(reason) => return GateDecision::Blocked(reason),
        };
        if date <= today {
            warnings.push(format!(
                "{} has been deprecated because it {} (since {})",
                descriptor.token, flag.because, date
            ));
        }
    }

    if descriptor.requires_manual_review() {
        if !overrides.allow_manual_review {
            return GateDecision::Blocked(BlockReason::ManualReview);
        }
        warnings.push(format!(
            "{} is flagged for manual review; proceeding on explicit override",
            descriptor.token
        ));
    }

    GateDecision::Proceed { warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: &str) -> Descriptor {
        serde_json::from_str(json).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn past_disable_date_blocks() {
        let d = descriptor(
            r#"{"token": "colorpicker-skalacolor",
                "disabled": {"date": "2024-09-30", "because": ":unmaintained"}}"#,
        );
        let decision = evaluate(&d, GateOverrides::default(), day(2024, 9, 30));
        assert_eq!(
            decision,
            GateDecision::Blocked(BlockReason::Disabled {
                date: day(2024, 9, 30),
                reason: LifecycleReason::Unmaintained,
                scheduled: false,
            })
        );
        let err = decision.into_result("colorpicker-skalacolor").unwrap_err();
        assert!(err.to_string().contains("is not maintained upstream"));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn future_disable_date_still_blocks() {
        let d = descriptor(
            r#"{"token": "x", "disabled": {"date": "2030-01-01", "because": "is 32-bit only"}}"#,
        );
        let decision = evaluate(&d, GateOverrides::default(), day(2026, 10, 19));
        assert_eq!(
            decision,
            GateDecision::Blocked(BlockReason::Disabled {
                date: day(2030, 1, 1),
                reason: LifecycleReason::Other("is 32-bit only".into()),
                scheduled: true,
            })
        );
        let err = decision.into_result("x").unwrap_err();
        assert!(err.to_string().contains("effective 2030-01-01"));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn deprecation_warns_only_once_effective() {
        let d = descriptor(
            r#"{"token": "x", "deprecated": {"date": "2025-06-01", "because": ":discontinued"}}"#,
        );
        assert_eq!(
            evaluate(&d, GateOverrides::default(), day(2025, 5, 31)),
            GateDecision::Proceed { warnings: vec![] }
        );
        match evaluate(&d, GateOverrides::default(), day(2025, 6, 1)) {
            GateDecision::Proceed { warnings } => {
                assert!(warnings[0].contains("is discontinued upstream"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn manual_review_needs_override() {
        let d = descriptor(
            r#"{"token": "mplab-xc8", "no_autobump": {"because": ":requires_manual_review"}}"#,
        );
        assert_eq!(
            evaluate(&d, GateOverrides::default(), day(2025, 1, 1)),
            GateDecision::Blocked(BlockReason::ManualReview)
        );
        let overrides = GateOverrides {
            allow_manual_review: true,
        };
        assert!(matches!(
            evaluate(&d, overrides, day(2025, 1, 1)),
            GateDecision::Proceed { .. }
        ));
    }

    #[test]
    fn unreadable_dates_default_to_deny() {
        let d = descriptor(
            r#"{"token": "x", "deprecated": {"date": "someday", "because": ":unsigned"}}"#,
        );
        assert!(matches!(
            evaluate(&d, GateOverrides::default(), day(2025, 1, 1)),
            GateDecision::Blocked(BlockReason::UnknownLifecycleState { field: "deprecated", .. })
        ));
    }

    #[test]
    fn plain_descriptor_proceeds() {
        let d = descriptor(r#"{"token": "x"}"#);
        assert_eq!(
            evaluate(&d, GateOverrides::default(), day(2025, 1, 1)),
            GateDecision::Proceed { warnings: vec![] }
        );
    }
}
