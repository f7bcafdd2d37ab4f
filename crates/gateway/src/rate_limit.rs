use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use transit_contracts::{IntakeDecision, SubmissionRecord};
use transit_ledger::{LedgerError, TransitLedger};
use transit_policy::{INTAKE_MAX_SUBMISSIONS, intake_decision, window_start};

/// Per-identity report intake guard. `check` never records; callers record
/// only after the report was persisted.
#[derive(Clone)]
pub enum IntakeGuard {
    Database(TransitLedger),
    Memory(MemoryIntake),
}

impl IntakeGuard {
    pub async fn check(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<IntakeDecision, LedgerError> {
        match self {
            IntakeGuard::Database(ledger) => ledger.check_intake(identity, now).await,
            IntakeGuard::Memory(memory) => Ok(memory.check(identity, now)),
        }
    }

    pub async fn record(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmissionRecord, LedgerError> {
        match self {
            IntakeGuard::Database(ledger) => ledger.record_submission(identity, now).await,
            IntakeGuard::Memory(memory) => Ok(memory.record(identity, now)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            IntakeGuard::Database(_) => "database",
            IntakeGuard::Memory(_) => "memory",
        }
    }
}

/// Sliding-window submission log kept in process memory.
#[derive(Clone)]
pub struct MemoryIntake {
    inner: Arc<Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>>,
    max_keys: usize,
}

impl MemoryIntake {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_keys: max_keys.max(1),
        }
    }

    pub fn check(&self, identity: &str, now: DateTime<Utc>) -> IntakeDecision {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let since = window_start(now);
        let count = inner
            .get(identity)
            .map(|events| events.iter().filter(|at| **at >= since).count())
            .unwrap_or(0);

        intake_decision(count as u64)
    }

    /// Records a submission. When the key set overflows, identities still
    /// under the limit are evicted first, oldest latest submission first.
    /// Denied identities are only dropped once nothing else is left to evict.
    pub fn record(&self, identity: &str, now: DateTime<Utc>) -> SubmissionRecord {
        let record = SubmissionRecord {
            ip_address: identity.to_string(),
            submitted_at: now,
        };
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let since = window_start(now);
        let queue = inner.entry(identity.to_string()).or_default();
        queue.push_back(now);

        inner.retain(|_, events| {
            prune_queue(events, since);
            !events.is_empty()
        });

        if inner.len() <= self.max_keys {
            return record;
        }

        let limit = INTAKE_MAX_SUBMISSIONS as usize;
        let mut candidates = inner
            .iter()
            .filter(|(key, _)| key.as_str() != identity)
            .filter_map(|(key, events)| {
                events
                    .back()
                    .map(|at| (events.len() >= limit, *at, key.clone()))
            })
            .collect::<Vec<_>>();
        candidates.sort();
        let overflow = inner.len() - self.max_keys;
        for (_, _, key) in candidates.into_iter().take(overflow) {
            inner.remove(&key);
        }
        record
    }

    pub fn tracked_identities(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

fn prune_queue(queue: &mut VecDeque<DateTime<Utc>>, since: DateTime<Utc>) {
    while let Some(front) = queue.front() {
        if *front < since {
            queue.pop_front();
        } else {
            break;
        }
    }
}
