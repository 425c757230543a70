//! Persistence of executions and their results.
//!
//! Sessions only see the traits, the in-memory implementation backs the binary and the tests.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use derive_more::Display;
use time::Date;

use crate::types::{ExecutionId, Frequency, Period, SessionId};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ExecutionStatus {
    Created,
    Configured,
    Running,
    Finished,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub session_id: SessionId,
    pub status: ExecutionStatus,
    pub start: Date,
    pub end: Date,
    pub frequency: Frequency,
    pub symbols: Vec<String>,
    pub benchmark: String,
}

#[derive(Clone, Debug)]
pub struct NewExecution {
    pub session_id: SessionId,
    pub start: Date,
    pub end: Date,
    pub frequency: Frequency,
    pub symbols: Vec<String>,
    pub benchmark: String,
}

/// Replaces the mutable part of an execution record.
#[derive(Clone, Debug)]
pub struct SimulationDetails {
    pub status: ExecutionStatus,
    pub start: Date,
    pub end: Date,
    pub symbols: Vec<String>,
    pub benchmark: String,
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: NewExecution) -> Result<ExecutionRecord>;
    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;
    async fn list_by_session(&self, session_id: SessionId) -> Result<Vec<ExecutionRecord>>;
    async fn update_simulation_details(&self, id: ExecutionId, details: SimulationDetails) -> Result<()>;
}

#[async_trait]
pub trait PeriodRepository: Send + Sync {
    async fn store(&self, periods: &[Period]) -> Result<()>;
    async fn list_by_execution(&self, id: ExecutionId) -> Result<Vec<Period>>;
}

#[derive(Debug)]
pub struct InMemoryRepository {
    next_id: AtomicU64,
    executions: Mutex<BTreeMap<ExecutionId, ExecutionRecord>>,
    periods: Mutex<Vec<Period>>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            executions: Mutex::new(BTreeMap::new()),
            periods: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn create(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = ExecutionRecord {
            id,
            session_id: execution.session_id,
            status: ExecutionStatus::Created,
            start: execution.start,
            end: execution.end,
            frequency: execution.frequency,
            symbols: execution.symbols,
            benchmark: execution.benchmark,
        };
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(executions.get(&id).cloned())
    }

    async fn list_by_session(&self, session_id: SessionId) -> Result<Vec<ExecutionRecord>> {
        let executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(executions
            .values()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_simulation_details(&self, id: ExecutionId, details: SimulationDetails) -> Result<()> {
        let mut executions = self.executions.lock().unwrap_or_else(PoisonError::into_inner);
        let record = executions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown execution {id}"))?;
        record.status = details.status;
        record.start = details.start;
        record.end = details.end;
        record.symbols = details.symbols;
        record.benchmark = details.benchmark;
        Ok(())
    }
}

#[async_trait]
impl PeriodRepository for InMemoryRepository {
    async fn store(&self, periods: &[Period]) -> Result<()> {
        self.periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(periods);
        Ok(())
    }

    async fn list_by_execution(&self, id: ExecutionId) -> Result<Vec<Period>> {
        let periods = self.periods.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(periods
            .iter()
            .filter(|period| period.execution_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    fn new_execution(session_id: SessionId) -> NewExecution {
        NewExecution {
            session_id,
            start: date!(2024 - 01 - 01),
            end: date!(2024 - 01 - 31),
            frequency: Frequency::Daily,
            symbols: vec!["ABC".to_string()],
            benchmark: "SPY".to_string(),
        }
    }

    #[tokio::test]
    async fn test_that_created_executions_are_listed_by_session() {
        let repo = InMemoryRepository::new();
        let first = repo.create(new_execution(1)).await.unwrap();
        let second = repo.create(new_execution(1)).await.unwrap();
        repo.create(new_execution(2)).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.status, ExecutionStatus::Created);
        assert_eq!(repo.list_by_session(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_that_update_replaces_details() {
        let repo = InMemoryRepository::new();
        let record = repo.create(new_execution(1)).await.unwrap();
        repo.update_simulation_details(
            record.id,
            SimulationDetails {
                status: ExecutionStatus::Finished,
                start: record.start,
                end: date!(2024 - 02 - 29),
                symbols: vec!["BCD".to_string()],
                benchmark: record.benchmark.clone(),
            },
        )
        .await
        .unwrap();

        let updated = repo.get(record.id).await.unwrap().unwrap();
        assert_eq!(updated.status, ExecutionStatus::Finished);
        assert_eq!(updated.end, date!(2024 - 02 - 29));
        assert_eq!(updated.symbols, vec!["BCD".to_string()]);
    }

    #[tokio::test]
    async fn test_that_updating_unknown_execution_fails() {
        let repo = InMemoryRepository::new();
        let res = repo
            .update_simulation_details(
                99,
                SimulationDetails {
                    status: ExecutionStatus::Failed,
                    start: date!(2024 - 01 - 01),
                    end: date!(2024 - 01 - 02),
                    symbols: vec![],
                    benchmark: String::new(),
                },
            )
            .await;
        assert!(res.is_err());
    }
}
