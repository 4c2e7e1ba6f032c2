use super::{key_prefix, record_key, Database, SweepAction};
use crate::retention::is_older_than;
use crate::{Collection, PruneReport, Result};
use arbor_types::{normalize_ip, now_ms, ApprovalRecord};
use std::net::IpAddr;
use std::time::Duration;

/// Outcome of consuming an approval on behalf of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalUse {
    Accepted(ApprovalRecord),
    /// Already consumed by another address.
    AlreadyUsed,
    Missing,
}

fn client_key(action: &str, client_ip: IpAddr) -> String {
    record_key(&[action, &normalize_ip(client_ip).to_string()])
}

impl Database {
    /// Store a pending approval. Any previous record of the same action and
    /// client is replaced.
    pub fn add_approval(&self, mut record: ApprovalRecord) -> Result<ApprovalRecord> {
        record.client_ip = normalize_ip(record.client_ip);
        self.insert(&record)?;
        Ok(record)
    }

    pub fn get_approval(&self, action: &str, key: &str) -> Result<Option<ApprovalRecord>> {
        Ok(self
            .find(&key_prefix(action), |record: &ApprovalRecord| record.key == key)?
            .into_iter()
            .next())
    }

    pub fn get_client_approval(
        &self,
        action: &str,
        client_ip: IpAddr,
    ) -> Result<Option<ApprovalRecord>> {
        self.find_one(&client_key(action, client_ip))
    }

    /// Record `consumer` in `used_by`. Only the first consumer, and later
    /// calls from the same address, are accepted.
    pub fn consume_approval(
        &self,
        action: &str,
        client_ip: IpAddr,
        key: &str,
        consumer: &str,
    ) -> Result<ApprovalUse> {
        let mut outcome = ApprovalUse::Missing;
        self.upsert::<ApprovalRecord>(&client_key(action, client_ip), |current| {
            outcome = ApprovalUse::Missing;
            let mut record = current?;
            if record.key != key {
                outcome = ApprovalUse::Missing;
                return Some(record);
            }
            if !record.used_by.is_empty() && !record.used_by.iter().any(|a| a == consumer) {
                outcome = ApprovalUse::AlreadyUsed;
                return Some(record);
            }
            if !record.used_by.iter().any(|a| a == consumer) {
                record.used_by.push(consumer.to_string());
            }
            outcome = ApprovalUse::Accepted(record.clone());
            Some(record)
        })?;
        Ok(outcome)
    }

    pub fn remove_approval(&self, action: &str, client_ip: IpAddr) -> Result<Option<ApprovalRecord>> {
        self.remove(&client_key(action, client_ip))
    }

    /// Expire approvals older than their action period; approvals of unknown
    /// actions are dropped.
    pub fn normalize_approval(&self, period: impl Fn(&str) -> Option<Duration>) -> Result<PruneReport> {
        let now = now_ms();
        let mut report = PruneReport::new(Collection::Approval);
        self.sweep::<ApprovalRecord>("", &mut report, |record| match period(&record.action) {
            Some(period) if !is_older_than(record.updated_at, period, now) => SweepAction::Keep,
            _ => SweepAction::Remove,
        })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str, ip: &str, key: &str) -> ApprovalRecord {
        ApprovalRecord {
            action: action.to_string(),
            client_ip: ip.parse().unwrap(),
            key: key.to_string(),
            started_at: 0,
            info: "info".into(),
            answer: "answer".into(),
            used_by: Vec::new(),
            updated_at: now_ms(),
        }
    }

    #[test]
    fn newest_approval_replaces_previous_for_same_client() {
        let db = Database::memory();
        db.add_approval(record("test", "127.0.0.1", "one")).unwrap();
        db.add_approval(record("test", "::ffff:127.0.0.1", "two"))
            .unwrap();

        assert!(db.get_approval("test", "one").unwrap().is_none());
        assert!(db.get_approval("test", "two").unwrap().is_some());
        assert_eq!(db.find::<ApprovalRecord>("", |_| true).unwrap().len(), 1);

        db.add_approval(record("test", "127.0.0.2", "three")).unwrap();
        db.add_approval(record("other", "127.0.0.1", "four")).unwrap();
        assert_eq!(db.find::<ApprovalRecord>("", |_| true).unwrap().len(), 3);
    }

    #[test]
    fn consumption_is_bound_to_first_consumer() {
        let db = Database::memory();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        db.add_approval(record("test", "127.0.0.1", "key")).unwrap();

        assert_eq!(
            db.consume_approval("test", ip, "wrong", "localhost:1").unwrap(),
            ApprovalUse::Missing
        );
        assert!(matches!(
            db.consume_approval("test", ip, "key", "localhost:1").unwrap(),
            ApprovalUse::Accepted(_)
        ));
        match db.consume_approval("test", ip, "key", "localhost:1").unwrap() {
            ApprovalUse::Accepted(record) => assert_eq!(record.used_by, vec!["localhost:1"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            db.consume_approval("test", ip, "key", "localhost:2").unwrap(),
            ApprovalUse::AlreadyUsed
        );
    }

    #[test]
    fn normalize_expires_by_action_period() {
        let db = Database::memory();
        let mut old = record("test", "127.0.0.1", "old");
        old.updated_at = 0;
        db.add_approval(old).unwrap();
        db.add_approval(record("test", "127.0.0.2", "fresh")).unwrap();
        db.add_approval(record("gone", "127.0.0.3", "orphan")).unwrap();

        let report = db
            .normalize_approval(|action| (action == "test").then(|| Duration::from_secs(300)))
            .unwrap();
        assert_eq!(report.pruned_entries, 2);
        assert!(db.get_approval("test", "fresh").unwrap().is_some());
    }
}
