//! In-memory store honoring the same all-or-nothing contracts as Postgres.
//! Backs the test suites.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lpsync_core::{ProgramId, ProgramUpdate, TargetProgram};

use crate::{
    validate_relation_name, validate_table_name, ProgramFilter, ProgramStore, StoreError,
    StoreResult, TableStore,
};

#[derive(Debug, Default)]
struct Faults {
    fail_update_id: Option<ProgramId>,
    fail_copy: bool,
    fail_replace: bool,
}

#[derive(Debug)]
pub struct MemoryStore {
    table: String,
    tables: Mutex<BTreeMap<String, Vec<TargetProgram>>>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new(table: impl Into<String>, programs: Vec<TargetProgram>) -> Self {
        let table = table.into();
        let mut tables = BTreeMap::new();
        tables.insert(table.clone(), sorted(programs));
        Self {
            table,
            tables: Mutex::new(tables),
            faults: Mutex::new(Faults::default()),
        }
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, Vec<TargetProgram>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current rows of the live table, ordered by id.
    pub fn programs(&self) -> Vec<TargetProgram> {
        self.tables().get(&self.table).cloned().unwrap_or_default()
    }

    pub fn table_rows(&self, name: &str) -> Option<Vec<TargetProgram>> {
        self.tables().get(name).cloned()
    }

    /// Makes any batch containing `id` fail mid-transaction.
    pub fn fail_updates_for(&self, id: ProgramId) {
        self.faults().fail_update_id = Some(id);
    }

    pub fn fail_backups(&self) {
        self.faults().fail_copy = true;
    }

    pub fn fail_restores(&self) {
        self.faults().fail_replace = true;
    }

    pub fn clear_faults(&self) {
        *self.faults() = Faults::default();
    }
}

fn sorted(mut programs: Vec<TargetProgram>) -> Vec<TargetProgram> {
    programs.sort_by_key(|p| p.id);
    programs
}

#[async_trait]
impl ProgramStore for MemoryStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn eligible_programs(&self, filter: &ProgramFilter) -> StoreResult<Vec<TargetProgram>> {
        let tables = self.tables();
        let rows = tables
            .get(&self.table)
            .ok_or_else(|| StoreError::TableNotFound(self.table.clone()))?;
        Ok(rows.iter().filter(|p| filter.admits(p)).cloned().collect())
    }

    async fn apply_updates(&self, updates: &[ProgramUpdate]) -> StoreResult<usize> {
        let fail_id = self.faults().fail_update_id;
        let mut tables = self.tables();
        let live = tables
            .get(&self.table)
            .ok_or_else(|| StoreError::TableNotFound(self.table.clone()))?;

        // Work on a copy and swap it in only once every update succeeded.
        let mut staged = live.clone();
        for update in updates {
            if Some(update.id) == fail_id {
                return Err(StoreError::Injected(format!(
                    "update of {} id={} rejected",
                    self.table, update.id
                )));
            }
            let row = staged
                .iter_mut()
                .find(|p| p.id == update.id)
                .ok_or_else(|| StoreError::RowMissing {
                    table: self.table.clone(),
                    id: update.id,
                })?;
            update.apply_to(row);
        }
        tables.insert(self.table.clone(), staged);
        Ok(updates.len())
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn table_names(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .tables()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn copy_table(&self, source: &str, destination: &str) -> StoreResult<u64> {
        validate_relation_name(source)?;
        validate_relation_name(destination)?;
        if self.faults().fail_copy {
            return Err(StoreError::Injected(format!("copy of {source} rejected")));
        }
        let mut tables = self.tables();
        if tables.contains_key(destination) {
            return Err(StoreError::TableExists(destination.to_string()));
        }
        let rows = tables
            .get(source)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(source.to_string()))?;
        let count = rows.len() as u64;
        tables.insert(destination.to_string(), rows);
        Ok(count)
    }

    async fn row_count(&self, table: &str) -> StoreResult<u64> {
        validate_relation_name(table)?;
        self.tables()
            .get(table)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn replace_contents(&self, live: &str, snapshot: &str) -> StoreResult<u64> {
        validate_table_name(live)?;
        validate_relation_name(snapshot)?;
        if self.faults().fail_replace {
            return Err(StoreError::Injected(format!("restore of {live} rejected")));
        }
        let mut tables = self.tables();
        let rows = tables
            .get(snapshot)
            .cloned()
            .ok_or_else(|| StoreError::TableNotFound(snapshot.to_string()))?;
        if !tables.contains_key(live) {
            return Err(StoreError::TableNotFound(live.to_string()));
        }
        let count = rows.len() as u64;
        tables.insert(live.to_string(), rows);
        Ok(count)
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        validate_relation_name(table)?;
        self.tables()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpsync_core::{ProgramDates, ProgramStatus};

    fn program(id: ProgramId, title: &str) -> TargetProgram {
        TargetProgram {
            id,
            title: title.into(),
            dates: ProgramDates::default(),
            status: ProgramStatus::Upcoming,
        }
    }

    fn start_update(id: ProgramId) -> ProgramUpdate {
        ProgramUpdate {
            id,
            dates: ProgramDates {
                start_date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1),
                ..Default::default()
            },
            status: Some(ProgramStatus::InProgress),
        }
    }

    #[tokio::test]
    async fn failed_batch_leaves_every_row_untouched() {
        let store = MemoryStore::new("Program", vec![program(1, "a"), program(2, "b")]);
        let before = store.programs();
        store.fail_updates_for(2);

        let err = store
            .apply_updates(&[start_update(1), start_update(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Injected(_)));
        assert_eq!(store.programs(), before);
    }

    #[tokio::test]
    async fn unknown_row_aborts_the_batch() {
        let store = MemoryStore::new("Program", vec![program(1, "a")]);
        let before = store.programs();
        let err = store
            .apply_updates(&[start_update(1), start_update(99)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowMissing { id: 99, .. }));
        assert_eq!(store.programs(), before);
    }

    #[tokio::test]
    async fn copy_refuses_to_overwrite() {
        let store = MemoryStore::new("Program", vec![program(1, "a")]);
        assert_eq!(store.copy_table("Program", "Program_copy").await.unwrap(), 1);
        let err = store.copy_table("Program", "Program_copy").await.unwrap_err();
        assert!(matches!(err, StoreError::TableExists(_)));
    }

    #[tokio::test]
    async fn copy_needs_an_existing_source() {
        let store = MemoryStore::new("Program", vec![program(1, "a")]);
        let err = store.copy_table("Missing", "Missing_copy").await.unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(name) if name == "Missing"));
        assert!(store.table_rows("Missing_copy").is_none());
    }

    #[tokio::test]
    async fn table_ops_validate_names_like_postgres() {
        let store = MemoryStore::new("Program", vec![program(1, "a")]);
        let too_long = format!("Program_{}", "x".repeat(60));
        for bad in ["", "Program copy", "Program\"; DROP TABLE x; --", too_long.as_str()] {
            let err = store.copy_table("Program", bad).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidTableName(_)), "{bad:?}: {err:?}");
            assert!(store.table_rows(bad).is_none());
        }
        assert!(matches!(
            store.drop_table("Program copy").await,
            Err(StoreError::InvalidTableName(_))
        ));
        assert!(matches!(
            store.replace_contents("Program-live", "Program").await,
            Err(StoreError::InvalidTableName(_))
        ));

        let snapshot = "Program_backup_2026-10-18T11-56-03-123456Z";
        assert_eq!(store.copy_table("Program", snapshot).await.unwrap(), 1);
        assert_eq!(store.row_count(snapshot).await.unwrap(), 1);
        store.drop_table(snapshot).await.unwrap();
    }
}
