// casket-core/src/install/journal.rs
use casket_common::error::Result;
use casket_common::model::{Action, ActionLog};

use crate::store::ActionLogStore;

/// The in-progress action log of one transaction. Every entry is persisted
/// before `record` returns.
pub(crate) struct Journal<'a> {
    store: &'a ActionLogStore,
    log: ActionLog,
}

impl<'a> Journal<'a> {
    pub(crate) fn begin(store: &'a ActionLogStore, log: ActionLog) -> Result<Self> {
        store.save(&log)?;
        Ok(Self { store, log })
    }

    pub(crate) fn record(&mut self, step_index: usize, step_kind: &str, action: Action) -> Result<()> {
        self.log.record(step_index, step_kind, action);
        self.store.save(&self.log)
    }

    pub(crate) fn add_caveat(&mut self, text: &str) {
        self.log.caveats = Some(match self.log.caveats.take() {
            Some(existing) => format!("{existing}\n{text}"),
            None => text.to_string(),
        });
    }

    pub(crate) fn log(&self) -> &ActionLog {
        &self.log
    }

    pub(crate) fn complete(mut self) -> Result<ActionLog> {
        self.log.mark_complete();
        self.store.save(&self.log)?;
        Ok(self.log)
    }
}
