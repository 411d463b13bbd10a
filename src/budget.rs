//! Budget-gated admission control.
//!
//! Each configured scope maps a run context to one counter:
//!
//! | Scope     | Counter key          |
//! |-----------|----------------------|
//! | `daily`   | `daily-YYYY-MM-DD`   |
//! | `project` | `project-<id>`       |
//! | `total`   | `total`              |
//! | `custom`  | `custom-<name>`      |
//!
//! Admission is a single atomic step: `check_and_reserve` evaluates every
//! scope and, if all pass, reserves the estimate against each counter under
//! the same lock. Concurrent callers therefore cannot overshoot a limit.
//! The reservation is later settled with actual usage or released unused.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{BudgetExceeded, StoreError};
use crate::state::TokenUsage;
use crate::store::{Store, get_typed, put_typed};

const LEDGER_NAMESPACE: &str = "budget";
const LEDGER_KEY: &str = "ledger";
/// How many `record_usage` ids are remembered for deduplication
const RECENT_USAGE_IDS: usize = 1024;

/// Kind of budget scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Daily,
    Project,
    Total,
    Custom,
}

/// A configured limit on one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimit {
    pub kind: ScopeKind,
    /// Required for `custom` scopes, ignored otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub limit: u64,
}

impl ScopeLimit {
    pub fn new(kind: ScopeKind, limit: u64) -> Self {
        Self {
            kind,
            name: None,
            limit,
        }
    }

    pub fn custom(name: &str, limit: u64) -> Self {
        Self {
            kind: ScopeKind::Custom,
            name: Some(name.to_string()),
            limit,
        }
    }

    /// Name used in errors and reports.
    pub fn label(&self) -> String {
        match self.kind {
            ScopeKind::Daily => "daily".to_string(),
            ScopeKind::Project => "project".to_string(),
            ScopeKind::Total => "total".to_string(),
            ScopeKind::Custom => self.name.clone().unwrap_or_else(|| "custom".to_string()),
        }
    }

    /// The counter this scope charges for `ctx`.
    pub fn counter_key(&self, ctx: &ScopeContext) -> String {
        match self.kind {
            ScopeKind::Daily => format!("daily-{}", ctx.date.format("%Y-%m-%d")),
            ScopeKind::Project => format!("project-{}", ctx.project_id),
            ScopeKind::Total => "total".to_string(),
            ScopeKind::Custom => format!("custom-{}", self.label()),
        }
    }
}

/// Who is spending: selects the counters each scope charges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub project_id: String,
    pub date: NaiveDate,
}

impl ScopeContext {
    /// Context for `project_id` on today's UTC date.
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            date: Utc::now().date_naive(),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }
}

/// Units held against a set of counters until settled or released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub units: u64,
    pub counters: Vec<String>,
}

/// One line of a budget report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeReport {
    pub scope: String,
    pub counter: String,
    pub limit: u64,
    pub used: u64,
    pub reserved: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub scopes: Vec<ScopeReport>,
}

/// Persisted part of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLedger {
    #[serde(default)]
    used: BTreeMap<String, u64>,
    #[serde(default)]
    recent_usage: VecDeque<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    used: BTreeMap<String, u64>,
    reserved: BTreeMap<String, u64>,
    /// Reservations neither settled nor released; not persisted
    outstanding: HashMap<String, Reservation>,
    /// Most recent `record_usage` ids, oldest first
    recent_usage: VecDeque<String>,
}

impl Ledger {
    fn used(&self, counter: &str) -> u64 {
        self.used.get(counter).copied().unwrap_or(0)
    }

    fn reserved(&self, counter: &str) -> u64 {
        self.reserved.get(counter).copied().unwrap_or(0)
    }

    fn unreserve(&mut self, reservation: &Reservation) {
        for counter in &reservation.counters {
            if let Some(held) = self.reserved.get_mut(counter) {
                *held = held.saturating_sub(reservation.units);
                if *held == 0 {
                    self.reserved.remove(counter);
                }
            }
        }
    }

    fn remember_usage(&mut self, usage_id: &str) {
        if self.recent_usage.len() == RECENT_USAGE_IDS {
            self.recent_usage.pop_front();
        }
        self.recent_usage.push_back(usage_id.to_string());
    }

    fn charge(&mut self, counters: &[String], units: u64) {
        for counter in counters {
            let used = self.used.entry(counter.clone()).or_insert(0);
            *used = used.saturating_add(units);
        }
    }
}

/// Admission control over per-scope counters.
pub struct BudgetEnforcer {
    limits: Vec<ScopeLimit>,
    ledger: Mutex<Ledger>,
    store: Option<Arc<dyn Store>>,
}

impl BudgetEnforcer {
    pub fn new(limits: Vec<ScopeLimit>) -> Self {
        Self {
            limits,
            ledger: Mutex::new(Ledger::default()),
            store: None,
        }
    }

    /// Enforcer with no scopes; admits everything.
    pub fn unlimited() -> Self {
        Self::new(Vec::new())
    }

    /// Persist committed usage to `store` after every change.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn limits(&self) -> &[ScopeLimit] {
        &self.limits
    }

    /// Replace in-memory counters with the persisted ledger, if any.
    pub async fn load(&self) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let persisted: Option<PersistedLedger> =
            get_typed(store.as_ref(), LEDGER_NAMESPACE, LEDGER_KEY).await?;
        if let Some(persisted) = persisted {
            let mut ledger = self.ledger.lock().await;
            ledger.used = persisted.used;
            ledger.recent_usage = persisted.recent_usage;
            debug!(counters = ledger.used.len(), "loaded budget ledger");
        }
        Ok(())
    }

    async fn persist(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let persisted = PersistedLedger {
            used: ledger.used.clone(),
            recent_usage: ledger.recent_usage.clone(),
        };
        put_typed(store.as_ref(), LEDGER_NAMESPACE, LEDGER_KEY, &persisted).await
    }

    /// Distinct counters charged for `ctx`; two scopes may share one.
    fn counters_for(&self, ctx: &ScopeContext) -> Vec<String> {
        self.limits
            .iter()
            .map(|l| l.counter_key(ctx))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Admit `estimated_units` against every scope or reject with the worst violation.
    ///
    /// All scopes are evaluated; the reported scope is the one overshot by the
    /// most units, and any other violated scopes are listed in `also_exceeded`.
    pub async fn check_and_reserve(
        &self,
        ctx: &ScopeContext,
        estimated_units: u64,
    ) -> Result<Reservation, BudgetExceeded> {
        let mut ledger = self.ledger.lock().await;

        let mut violations: Vec<(u64, BudgetExceeded)> = Vec::new();
        for limit in &self.limits {
            let counter = limit.counter_key(ctx);
            let current = ledger.used(&counter).saturating_add(ledger.reserved(&counter));
            let projected = current.saturating_add(estimated_units);
            if projected > limit.limit {
                violations.push((
                    projected - limit.limit,
                    BudgetExceeded {
                        scope: limit.label(),
                        limit: limit.limit,
                        current,
                        requested: estimated_units,
                        also_exceeded: Vec::new(),
                    },
                ));
            }
        }

        if !violations.is_empty() {
            let worst = violations
                .iter()
                .enumerate()
                .max_by(|(ia, (a, _)), (ib, (b, _))| a.cmp(b).then(ib.cmp(ia)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let (_, mut err) = violations.swap_remove(worst);
            err.also_exceeded = violations.into_iter().map(|(_, v)| v.scope).collect();
            err.also_exceeded.sort();
            warn!(
                scope = %err.scope,
                limit = err.limit,
                current = err.current,
                requested = err.requested,
                "budget admission rejected"
            );
            return Err(err);
        }

        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            units: estimated_units,
            counters: self.counters_for(ctx),
        };
        for counter in &reservation.counters {
            let held = ledger.reserved.entry(counter.clone()).or_insert(0);
            *held = held.saturating_add(estimated_units);
        }
        ledger
            .outstanding
            .insert(reservation.id.clone(), reservation.clone());
        debug!(id = %reservation.id, units = estimated_units, "budget reserved");
        Ok(reservation)
    }

    /// Release a reservation and charge actual usage.
    ///
    /// Only an outstanding reservation is charged, so settling twice, or after
    /// `release`, is a no-op.
    pub async fn settle(
        &self,
        reservation: &Reservation,
        usage: TokenUsage,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        let Some(held) = ledger.outstanding.remove(&reservation.id) else {
            debug!(id = %reservation.id, "reservation already settled or released");
            return Ok(());
        };
        ledger.unreserve(&held);
        ledger.charge(&held.counters, usage.total());
        self.persist(&ledger).await
    }

    /// Free a reservation without charging anything.
    pub async fn release(&self, reservation: &Reservation) {
        let mut ledger = self.ledger.lock().await;
        if ledger.outstanding.remove(&reservation.id).is_some() {
            ledger.unreserve(reservation);
            debug!(id = %reservation.id, "budget reservation released");
        }
    }

    /// Charge usage outside any reservation. Repeating one of the last
    /// `RECENT_USAGE_IDS` usage ids is a no-op; returns whether this call
    /// applied the usage.
    pub async fn record_usage(
        &self,
        ctx: &ScopeContext,
        usage_id: &str,
        input_units: u64,
        output_units: u64,
    ) -> Result<bool, StoreError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.recent_usage.iter().any(|id| id == usage_id) {
            return Ok(false);
        }
        let counters = self.counters_for(ctx);
        ledger.charge(&counters, TokenUsage::new(input_units, output_units).total());
        ledger.remember_usage(usage_id);
        self.persist(&ledger).await?;
        Ok(true)
    }

    /// Remaining units per scope label, net of outstanding reservations.
    pub async fn get_remaining_budget(&self, ctx: &ScopeContext) -> BTreeMap<String, u64> {
        self.report(ctx)
            .await
            .scopes
            .into_iter()
            .map(|s| (s.scope, s.remaining))
            .collect()
    }

    pub async fn report(&self, ctx: &ScopeContext) -> BudgetReport {
        let ledger = self.ledger.lock().await;
        let scopes = self
            .limits
            .iter()
            .map(|limit| {
                let counter = limit.counter_key(ctx);
                let used = ledger.used(&counter);
                let reserved = ledger.reserved(&counter);
                ScopeReport {
                    scope: limit.label(),
                    limit: limit.limit,
                    used,
                    reserved,
                    remaining: limit.limit.saturating_sub(used.saturating_add(reserved)),
                    counter,
                }
            })
            .collect();
        BudgetReport { scopes }
    }

    /// Committed usage of the counters `ctx` charges.
    pub async fn counters(&self, ctx: &ScopeContext) -> BTreeMap<String, u64> {
        let ledger = self.ledger.lock().await;
        self.counters_for(ctx)
            .into_iter()
            .map(|c| {
                let used = ledger.used(&c);
                (c, used)
            })
            .collect()
    }

    /// Drop one counter, e.g. when a daily period rolls over.
    pub async fn reset_counter(&self, counter: &str) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        if ledger.used.remove(counter).is_some() {
            info!(counter, "budget counter reset");
        }
        self.persist(&ledger).await
    }
}
