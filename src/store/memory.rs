use std::collections::HashMap;

use crate::error::StoreError;
use crate::model::SequenceRun;

use super::RunStore;

/// Keeps runs for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: HashMap<String, SequenceRun>,
    created: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunStore for MemoryStore {
    fn create_run(&mut self, run: &SequenceRun) -> Result<(), StoreError> {
        self.save_run(run)
    }

    fn save_run(&mut self, run: &SequenceRun) -> Result<(), StoreError> {
        if self.runs.insert(run.id.clone(), run.clone()).is_none() {
            self.created.push(run.id.clone());
        }
        Ok(())
    }

    fn load_run(&self, id: &str) -> Result<SequenceRun, StoreError> {
        self.runs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn runs_for_instance(&self, instance_id: &str) -> Result<Vec<SequenceRun>, StoreError> {
        Ok(self
            .created
            .iter()
            .filter_map(|id| self.runs.get(id))
            .filter(|run| run.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
