// casket-common/src/catalog.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::{CasketError, Result};
use super::model::descriptor::{Descriptor, DescriptorList};

/// Read-only set of descriptors keyed by token.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    descriptors: BTreeMap<String, Arc<Descriptor>>,
    rejected: Vec<(PathBuf, String)>,
}

impl Catalog {
    /// Loads every `*.json` file in `dir`. A file holds one descriptor or a
    /// `{ "casks": [...] }` list. Files that fail to parse or validate are
    /// skipped and reported through [`Catalog::rejected`].
    pub fn load(dir: &Path) -> Result<Self> {
        let mut catalog = Catalog::default();
        if !dir.is_dir() {
            debug!("Catalog directory {} does not exist; catalog is empty", dir.display());
            return Ok(catalog);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
            .collect();
        files.sort();

        for file in files {
            match Self::read_file(&file) {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        if let Err(e) = catalog.insert(descriptor) {
                            warn!("Skipping descriptor in {}: {}", file.display(), e);
                            catalog.rejected.push((file.clone(), e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping catalog file {}: {}", file.display(), e);
                    catalog.rejected.push((file, e.to_string()));
                }
            }
        }
        debug!(
            "Loaded {} descriptors from {} ({} rejected)",
            catalog.descriptors.len(),
            dir.display(),
            catalog.rejected.len()
        );
        Ok(catalog)
    }

    fn read_file(path: &Path) -> Result<Vec<Descriptor>> {
        let raw = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        if value.get("casks").is_some() {
            let list: DescriptorList = serde_json::from_value(value)?;
            Ok(list.casks)
        } else {
            Ok(vec![serde_json::from_value(value)?])
        }
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = Descriptor>) -> Result<Self> {
        let mut catalog = Catalog::default();
        for descriptor in descriptors {
            catalog.insert(descriptor)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, descriptor: Descriptor) -> Result<()> {
        descriptor.validate()?;
        if self.descriptors.contains_key(&descriptor.token) {
            return Err(CasketError::Validation(format!(
                "Duplicate descriptor token '{}'",
                descriptor.token
            )));
        }
        self.descriptors
            .insert(descriptor.token.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, token: &str) -> Result<Arc<Descriptor>> {
        self.descriptors
            .get(token)
            .cloned()
            .ok_or_else(|| CasketError::NotFound(format!("No descriptor named '{token}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn rejected(&self) -> &[(PathBuf, String)] {
        &self.rejected
    }
}
