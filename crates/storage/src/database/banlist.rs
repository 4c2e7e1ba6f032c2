use super::{Database, SweepAction};
use crate::{Collection, PruneReport, Result};
use arbor_types::{address_ip, normalize_ip, now_ms, BanlistEntry};
use std::net::IpAddr;
use std::time::Duration;

impl Database {
    /// Ban `address` for `lifetime`. An existing entry is replaced.
    pub fn add_banlist_address(
        &self,
        address: &str,
        ip: Option<IpAddr>,
        lifetime: Duration,
    ) -> Result<BanlistEntry> {
        let now = now_ms();
        let entry = BanlistEntry {
            address: address.to_string(),
            ip: ip.or_else(|| address_ip(address)).map(normalize_ip),
            resolved_at: now.saturating_add(lifetime.as_millis() as u64),
            created_at: now,
        };
        self.insert(&entry)?;
        Ok(entry)
    }

    /// The active ban for `address`, if any.
    pub fn get_banlist_address(&self, address: &str) -> Result<Option<BanlistEntry>> {
        let now = now_ms();
        Ok(self
            .find_one::<BanlistEntry>(address)?
            .filter(|entry| entry.is_active(now)))
    }

    pub fn get_banlist(&self) -> Result<Vec<BanlistEntry>> {
        let now = now_ms();
        self.find("", |entry: &BanlistEntry| entry.is_active(now))
    }

    /// Whether any active ban covers `ip`, whatever the port.
    pub fn check_banlist_ip(&self, ip: IpAddr) -> Result<bool> {
        let ip = normalize_ip(ip);
        let now = now_ms();
        Ok(self.count("", |entry: &BanlistEntry| {
            entry.is_active(now) && entry.ip == Some(ip)
        })? > 0)
    }

    pub fn remove_banlist_address(&self, address: &str) -> Result<Option<BanlistEntry>> {
        self.remove(address)
    }

    /// Drop expired bans.
    pub fn normalize_banlist(&self) -> Result<PruneReport> {
        let now = now_ms();
        let mut report = PruneReport::new(Collection::Banlist);
        self.sweep::<BanlistEntry>("", &mut report, |entry| {
            if entry.is_active(now) {
                SweepAction::Keep
            } else {
                SweepAction::Remove
            }
        })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_is_unique_per_address() {
        let db = Database::memory();
        db.add_banlist_address("localhost:1", None, Duration::from_secs(60))
            .unwrap();
        db.add_banlist_address("localhost:1", None, Duration::from_secs(120))
            .unwrap();
        assert_eq!(db.get_banlist().unwrap().len(), 1);
        assert!(db.get_banlist_address("localhost:2").unwrap().is_none());
    }

    #[test]
    fn ip_lookup_ignores_port_and_mapping() {
        let db = Database::memory();
        db.add_banlist_address("127.0.0.1:5000", None, Duration::from_secs(60))
            .unwrap();
        assert!(db.check_banlist_ip("127.0.0.1".parse().unwrap()).unwrap());
        assert!(db
            .check_banlist_ip("::ffff:127.0.0.1".parse().unwrap())
            .unwrap());
        assert!(!db.check_banlist_ip("127.0.0.2".parse().unwrap()).unwrap());
    }

    #[test]
    fn normalize_drops_expired_entries() {
        let db = Database::memory();
        db.add_banlist_address("localhost:1", None, Duration::ZERO)
            .unwrap();
        db.add_banlist_address("localhost:2", None, Duration::from_secs(60))
            .unwrap();
        assert!(db.get_banlist_address("localhost:1").unwrap().is_none());

        let report = db.normalize_banlist().unwrap();
        assert_eq!(report.pruned_entries, 1);
        assert!(db.find_one::<BanlistEntry>("localhost:1").unwrap().is_none());
        assert!(db.get_banlist_address("localhost:2").unwrap().is_some());

        db.remove_banlist_address("localhost:2").unwrap();
        assert!(db.get_banlist().unwrap().is_empty());
    }
}
