use super::{key_prefix, record_key, Database, Document, SweepAction};
use crate::retention::is_older_than;
use crate::{Collection, PruneReport, Result};
use arbor_types::{
    duration_serde, now_ms, BanlistEntry, BehaviorCandidate, BehaviorDelay, BehaviorFail,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bounds of the candidacy ledger for one action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateOptions {
    /// Maximum number of distinct candidates kept per action.
    pub limit: usize,
    /// Excuse granted to every other candidate when a candidacy is recorded.
    pub excuse_step: f64,
}

/// How much suspicion one fail adds or removes.
#[derive(Clone)]
pub enum FailStep {
    Value(f64),
    Computed(Arc<dyn Fn(&BehaviorFail) -> f64 + Send + Sync>),
}

impl FailStep {
    pub fn computed(step: impl Fn(&BehaviorFail) -> f64 + Send + Sync + 'static) -> Self {
        FailStep::Computed(Arc::new(step))
    }

    fn amount(&self, record: &BehaviorFail) -> f64 {
        match self {
            FailStep::Value(value) => *value,
            FailStep::Computed(step) => step(record),
        }
    }
}

impl Default for FailStep {
    fn default() -> Self {
        FailStep::Value(1.0)
    }
}

impl From<f64> for FailStep {
    fn from(value: f64) -> Self {
        FailStep::Value(value)
    }
}

impl fmt::Debug for FailStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailStep::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FailStep::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Ban rules attached to one fail action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailPolicy {
    pub ban: bool,
    #[serde(with = "duration_serde")]
    pub ban_lifetime: Duration,
    /// Minimum age of a fail record before it may turn into a ban.
    #[serde(with = "duration_serde")]
    pub ban_delay: Duration,
    pub fail_suspicion_level: f64,
    /// Records idle this long are forgotten.
    #[serde(with = "duration_serde")]
    pub fail_lifetime: Duration,
}

impl Default for FailPolicy {
    fn default() -> Self {
        Self {
            ban: true,
            ban_lifetime: Duration::from_secs(18 * 60),
            ban_delay: Duration::ZERO,
            fail_suspicion_level: 100.0,
            fail_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Result of the fails sweep.
#[derive(Debug, Clone)]
pub struct FailSweep {
    pub report: PruneReport,
    pub banned: Vec<BanlistEntry>,
}

fn weakest_candidate_first(a: &BehaviorCandidate, b: &BehaviorCandidate) -> Ordering {
    a.suspicion
        .partial_cmp(&b.suspicion)
        .unwrap_or(Ordering::Equal)
        .then(a.seq.cmp(&b.seq))
}

impl Database {
    /// Record a candidacy of `address` for `action`.
    ///
    /// A repeated candidacy raises suspicion by one. Every other candidate of
    /// the action earns `excuse_step` of excuse. When a new address overflows
    /// the limit, the weakest other candidate is dropped.
    pub fn add_behavior_candidate(
        &self,
        action: &str,
        address: &str,
        options: CandidateOptions,
    ) -> Result<BehaviorCandidate> {
        let prefix = key_prefix(action);
        for other in self.find(&prefix, |c: &BehaviorCandidate| c.address != address)? {
            self.upsert::<BehaviorCandidate>(&other.key(), |current| {
                current.map(|mut candidate| {
                    candidate.excuse += options.excuse_step;
                    candidate
                })
            })?;
        }

        let now = now_ms();
        let seq = self.generate_id()?;
        let mut inserted = false;
        let candidate = self
            .upsert::<BehaviorCandidate>(&record_key(&[action, address]), |current| {
                inserted = current.is_none();
                Some(match current {
                    Some(mut candidate) => {
                        candidate.suspicion += 1.0;
                        candidate.updated_at = now;
                        candidate
                    }
                    None => BehaviorCandidate {
                        action: action.to_string(),
                        address: address.to_string(),
                        suspicion: 1.0,
                        excuse: 0.0,
                        seq,
                        created_at: now,
                        updated_at: now,
                    },
                })
            })?
            .ok_or(crate::StorageError::NotInitialized)?;

        if inserted {
            let mut others: Vec<BehaviorCandidate> =
                self.find(&prefix, |c: &BehaviorCandidate| c.address != address)?;
            let excess = (others.len() + 1).saturating_sub(options.limit);
            others.sort_by(weakest_candidate_first);
            for evicted in others.into_iter().take(excess) {
                self.remove::<BehaviorCandidate>(&evicted.key())?;
            }
        }
        Ok(candidate)
    }

    pub fn get_behavior_candidate(
        &self,
        action: &str,
        address: &str,
    ) -> Result<Option<BehaviorCandidate>> {
        self.find_one(&record_key(&[action, address]))
    }

    /// Candidates whose suspicion reached `level`.
    pub fn get_behavior_candidates(&self, action: &str, level: f64) -> Result<Vec<BehaviorCandidate>> {
        self.find(&key_prefix(action), |c: &BehaviorCandidate| c.suspicion >= level)
    }

    /// Cap suspicion at `level`, then drop candidates whose excuse outweighs
    /// their suspicion or that went idle for `lifetime`.
    pub fn normalize_behavior_candidates(
        &self,
        level: f64,
        lifetime: Option<Duration>,
    ) -> Result<PruneReport> {
        let now = now_ms();
        let mut report = PruneReport::new(Collection::BehaviorCandidates);
        self.sweep::<BehaviorCandidate>("", &mut report, |mut candidate| {
            if lifetime.is_some_and(|lifetime| is_older_than(candidate.updated_at, lifetime, now)) {
                return SweepAction::Remove;
            }
            let decayed = candidate.suspicion > level;
            if decayed {
                candidate.suspicion = level;
            }
            if candidate.excuse > candidate.suspicion {
                SweepAction::Remove
            } else if decayed {
                SweepAction::Update(candidate)
            } else {
                SweepAction::Keep
            }
        })?;
        Ok(report)
    }

    /// Raise suspicion by `step` and count one more fail.
    pub fn add_behavior_fail(
        &self,
        action: &str,
        address: &str,
        step: &FailStep,
    ) -> Result<BehaviorFail> {
        let now = now_ms();
        self.upsert::<BehaviorFail>(&record_key(&[action, address]), |current| {
            let mut record = current.unwrap_or_else(|| BehaviorFail {
                action: action.to_string(),
                address: address.to_string(),
                suspicion: 0.0,
                balance: 0,
                up: 0,
                down: 0,
                created_at: now,
                updated_at: now,
            });
            record.suspicion += step.amount(&record);
            record.balance += 1;
            record.up += 1;
            record.updated_at = now;
            Some(record)
        })?
        .ok_or(crate::StorageError::NotInitialized)
    }

    /// Inverse of [`Database::add_behavior_fail`]; the record disappears once
    /// suspicion reaches zero. Returns the remaining record.
    pub fn sub_behavior_fail(
        &self,
        action: &str,
        address: &str,
        step: &FailStep,
    ) -> Result<Option<BehaviorFail>> {
        let now = now_ms();
        self.upsert::<BehaviorFail>(&record_key(&[action, address]), |current| {
            let mut record = current?;
            record.suspicion -= step.amount(&record);
            record.balance -= 1;
            record.down += 1;
            record.updated_at = now;
            (record.suspicion > 0.0).then_some(record)
        })
    }

    pub fn get_behavior_fail(&self, action: &str, address: &str) -> Result<Option<BehaviorFail>> {
        self.find_one(&record_key(&[action, address]))
    }

    pub fn get_behavior_fails(&self, action: &str) -> Result<Vec<BehaviorFail>> {
        self.find(&key_prefix(action), |_: &BehaviorFail| true)
    }

    pub fn remove_behavior_fail(&self, action: &str, address: &str) -> Result<Option<BehaviorFail>> {
        self.remove(&record_key(&[action, address]))
    }

    /// Forget idle fails and turn excessive suspicion into bans.
    ///
    /// Records of actions without a policy are dropped.
    pub fn normalize_behavior_fails(
        &self,
        policy: impl Fn(&str) -> Option<FailPolicy>,
    ) -> Result<FailSweep> {
        let now = now_ms();
        let mut report = PruneReport::new(Collection::BehaviorFails);
        let mut banned = Vec::new();
        let mut ban_failures = 0;

        self.sweep::<BehaviorFail>("", &mut report, |record| {
            let Some(policy) = policy(&record.action) else {
                warn!(
                    "Dropping fail record of {} for unregistered action {}",
                    record.address, record.action
                );
                return SweepAction::Remove;
            };
            if is_older_than(record.updated_at, policy.fail_lifetime, now) {
                return SweepAction::Remove;
            }
            if record.suspicion <= policy.fail_suspicion_level {
                return SweepAction::Keep;
            }
            if now.saturating_sub(record.created_at) < policy.ban_delay.as_millis() as u64 {
                return SweepAction::Keep;
            }
            if !policy.ban {
                return SweepAction::Remove;
            }
            // The fail record goes only once the ban is stored.
            match self.add_banlist_address(&record.address, None, policy.ban_lifetime) {
                Ok(entry) => {
                    info!("Banned {} for {:?}", record.address, policy.ban_lifetime);
                    banned.push(entry);
                    SweepAction::Remove
                }
                Err(err) => {
                    warn!("Failed to ban {}: {}", record.address, err);
                    ban_failures += 1;
                    SweepAction::Keep
                }
            }
        })?;
        report.failed_entries += ban_failures;

        Ok(FailSweep { report, banned })
    }

    /// Idempotent: an existing delay keeps its original timestamp.
    pub fn add_behavior_delay(&self, action: &str, address: &str) -> Result<BehaviorDelay> {
        let now = now_ms();
        self.upsert::<BehaviorDelay>(&record_key(&[action, address]), |current| {
            Some(current.unwrap_or_else(|| BehaviorDelay {
                action: action.to_string(),
                address: address.to_string(),
                created_at: now,
            }))
        })?
        .ok_or(crate::StorageError::NotInitialized)
    }

    pub fn get_behavior_delay(&self, action: &str, address: &str) -> Result<Option<BehaviorDelay>> {
        self.find_one(&record_key(&[action, address]))
    }

    pub fn get_behavior_delays(&self, action: &str) -> Result<Vec<BehaviorDelay>> {
        self.find(&key_prefix(action), |_: &BehaviorDelay| true)
    }

    pub fn remove_behavior_delay(&self, action: &str, address: &str) -> Result<Option<BehaviorDelay>> {
        self.remove(&record_key(&[action, address]))
    }

    pub fn clear_behavior_delays(&self, action: &str) -> Result<usize> {
        self.remove_where(&key_prefix(action), |_: &BehaviorDelay| true)
    }
}
