//! # Persistence
//!
//! Sequence runs are written after every test so a suspended run survives the
//! process that started it.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::model::SequenceRun;

pub trait RunStore {
    fn create_run(&mut self, run: &SequenceRun) -> Result<(), StoreError>;

    /// Overwrites the stored copy of `run`, creating it if needed.
    fn save_run(&mut self, run: &SequenceRun) -> Result<(), StoreError>;

    fn load_run(&self, id: &str) -> Result<SequenceRun, StoreError>;

    /// Runs of an instance, oldest first.
    fn runs_for_instance(&self, instance_id: &str) -> Result<Vec<SequenceRun>, StoreError>;

    /// Most recently created run of `sequence_name` on the instance.
    fn latest_run(&self, instance_id: &str, sequence_name: &str) -> Result<Option<SequenceRun>, StoreError> {
        Ok(self
            .runs_for_instance(instance_id)?
            .into_iter()
            .rev()
            .find(|run| run.sequence_name == sequence_name))
    }
}
