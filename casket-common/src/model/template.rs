// casket-common/src/model/template.rs
//! `#{...}` interpolation for URLs, step paths and script arguments.

use std::path::PathBuf;

use crate::error::{CasketError, Result};

/// Values a descriptor string may reference. Built per transaction and passed
/// explicitly to every step.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub token: String,
    pub version: String,
    pub arch: String,
    pub staged_path: PathBuf,
    pub appdir: PathBuf,
    pub home: PathBuf,
}

/// Architecture name used by `#{arch}`.
pub fn current_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "x86_64"
    }
}

impl TemplateContext {
    pub fn render(&self, input: &str) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("#{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                CasketError::Validation(format!("Unterminated '#{{' in template '{input}'"))
            })?;
            let key = after[..end].trim();
            out.push_str(&self.lookup(key, input)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    pub fn render_all(&self, inputs: &[String]) -> Result<Vec<String>> {
        inputs.iter().map(|s| self.render(s)).collect()
    }

    fn lookup(&self, key: &str, template: &str) -> Result<String> {
        let value = match key {
            "token" => Some(self.token.clone()),
            "arch" => Some(self.arch.clone()),
            "staged_path" => Some(self.staged_path.to_string_lossy().into_owned()),
            "appdir" => Some(self.appdir.to_string_lossy().into_owned()),
            "home" => Some(self.home.to_string_lossy().into_owned()),
            "version" => Some(self.version.clone()),
            other => match other.strip_prefix("version.") {
                Some(accessor) => version_accessor(&self.version, accessor),
                None => {
                    return Err(CasketError::Validation(format!(
                        "Unknown template token '#{{{key}}}' in '{template}'"
                    )))
                }
            },
        };
        value.ok_or_else(|| {
            CasketError::Validation(format!(
                "Version '{}' has no component for '#{{{key}}}' in '{template}'",
                self.version
            ))
        })
    }
}

fn version_accessor(version: &str, accessor: &str) -> Option<String> {
    let mut csv = version.split(',');
    let primary = csv.next().unwrap_or_default();
    let dotted: Vec<&str> = primary.split('.').collect();
    let component = |i: usize| dotted.get(i).filter(|s| !s.is_empty()).map(|s| s.to_string());

    match accessor {
        "major" => component(0),
        "minor" => component(1),
        "patch" => component(2),
        "major_minor" => Some(format!("{}.{}", component(0)?, component(1)?)),
        "no_dots" => Some(version.replace('.', "")),
        "csv.first" | "before_comma" => Some(primary.to_string()),
        "csv.second" | "after_comma" => version.split(',').nth(1).map(str::to_string),
        "csv.third" => version.split(',').nth(2).map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(version: &str) -> TemplateContext {
        TemplateContext {
            token: "mplab-xc8".into(),
            version: version.into(),
            arch: "arm64".into(),
            staged_path: PathBuf::from("/opt/casket/Caskroom/mplab-xc8/3.00"),
            appdir: PathBuf::from("/Applications"),
            home: PathBuf::from("/Users/me"),
        }
    }

    #[test]
    fn substitutes_version_into_url() {
        let rendered = ctx("3.00")
            .render("https://example.com/xc8-v#{version}-full-install-macos-x64-installer.dmg")
            .unwrap();
        assert_eq!(
            rendered,
            "https://example.com/xc8-v3.00-full-install-macos-x64-installer.dmg"
        );
    }

    #[test]
    fn version_accessors() {
        let c = ctx("2.6.2,1234");
        assert_eq!(c.render("#{version.major}").unwrap(), "2");
        assert_eq!(c.render("#{version.major_minor}").unwrap(), "2.6");
        assert_eq!(c.render("#{version.patch}").unwrap(), "2");
        assert_eq!(c.render("#{version.csv.first}").unwrap(), "2.6.2");
        assert_eq!(c.render("#{version.csv.second}").unwrap(), "1234");
        assert_eq!(c.render("#{version.no_dots}").unwrap(), "262,1234");
    }

    #[test]
    fn staged_path_and_home() {
        let c = ctx("3.00");
        assert_eq!(
            c.render("#{staged_path}/bin/xc8-cc").unwrap(),
            "/opt/casket/Caskroom/mplab-xc8/3.00/bin/xc8-cc"
        );
        assert_eq!(c.render("#{home}/Library").unwrap(), "/Users/me/Library");
    }

    #[test]
    fn unknown_or_missing_tokens_are_errors() {
        assert!(ctx("1.0").render("#{nonsense}").is_err());
        assert!(ctx("1.0").render("#{version.patch}").is_err());
        assert!(ctx("1.0").render("#{version").is_err());
    }
}
