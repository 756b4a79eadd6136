//! In-memory settings and tunnel stores
//!
//! Both stores publish through `tokio::sync::watch`, so every reader gets a
//! consistent snapshot plus a change stream. Persisting to disk is the
//! caller's business (the daemon subscribes and writes the TOML file).

use crate::config::{Settings, TunnelConf};
use crate::error::ConfigError;
use crate::network::{match_ssid, SsidMatch};
use crate::types::TunnelId;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Process-wide settings with a change stream
#[derive(Debug, Clone)]
pub struct SettingsStore {
    tx: Arc<watch::Sender<Settings>>,
}

impl SettingsStore {
    /// Create a store holding validated settings
    pub fn new(settings: Settings) -> Result<Self, ConfigError> {
        settings
            .validate()
            .map_err(|message| ConfigError::ValidationError { message })?;
        let (tx, _rx) = watch::channel(settings);
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Current settings
    pub fn snapshot(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every committed change
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Apply a mutation, committing it only if the result validates
    ///
    /// Returns whether anything changed.
    pub fn update<F>(&self, mutate: F) -> Result<bool, ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.snapshot();
        mutate(&mut next);
        next.validate()
            .map_err(|message| ConfigError::ValidationError { message })?;

        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!("Settings updated");
        }
        Ok(changed)
    }
}

/// Ordered set of user-defined tunnels with a change stream
///
/// Insertion order is preserved; it is the final tie-break when several
/// tunnels qualify for the same binding.
#[derive(Debug, Clone)]
pub struct TunnelRepository {
    tx: Arc<watch::Sender<Vec<TunnelConf>>>,
}

impl TunnelRepository {
    /// Create a repository from tunnels in insertion order
    ///
    /// Ids and names must be unique. The primary, mobile-data and ethernet
    /// flags are normalised so at most one tunnel carries each (first wins).
    pub fn new(tunnels: Vec<TunnelConf>) -> Result<Self, ConfigError> {
        let mut normalised: Vec<TunnelConf> = Vec::with_capacity(tunnels.len());
        for conf in tunnels {
            conf.validate()
                .map_err(|message| ConfigError::ValidationError { message })?;
            check_unique(&normalised, &conf)?;
            normalised.push(conf);
        }
        normalise_flags(&mut normalised);

        let (tx, _rx) = watch::channel(normalised);
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Snapshot of every tunnel in insertion order
    pub fn all(&self) -> Vec<TunnelConf> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TunnelConf>> {
        self.tx.subscribe()
    }

    pub fn find_by_id(&self, id: TunnelId) -> Option<TunnelConf> {
        self.tx.borrow().iter().find(|t| t.id == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<TunnelConf> {
        self.tx.borrow().iter().find(|t| t.name == name).cloned()
    }

    pub fn find_primary(&self) -> Option<TunnelConf> {
        self.tx.borrow().iter().find(|t| t.is_primary).cloned()
    }

    pub fn find_mobile_data_tunnel(&self) -> Option<TunnelConf> {
        self.tx.borrow().iter().find(|t| t.is_mobile_data_tunnel).cloned()
    }

    pub fn find_ethernet_tunnel(&self) -> Option<TunnelConf> {
        self.tx.borrow().iter().find(|t| t.is_ethernet_tunnel).cloned()
    }

    /// Tunnels bound to the SSID, exact bindings ahead of wildcard ones
    pub fn find_by_tunnel_network(&self, ssid: &str, wildcards: bool) -> Vec<TunnelConf> {
        let tunnels = self.tx.borrow();
        let mut matches: Vec<(SsidMatch, usize, &TunnelConf)> = tunnels
            .iter()
            .enumerate()
            .filter_map(|(index, conf)| {
                conf.tunnel_networks
                    .iter()
                    .filter_map(|pattern| match_ssid(pattern, ssid, wildcards))
                    .min()
                    .map(|rank| (rank, index, conf))
            })
            .collect();
        matches.sort_by_key(|(rank, index, _)| (*rank, *index));
        matches.into_iter().map(|(_, _, conf)| conf.clone()).collect()
    }

    /// Tunnels flagged as running when last seen
    pub fn find_active(&self) -> Vec<TunnelConf> {
        self.tx.borrow().iter().filter(|t| t.is_active).cloned().collect()
    }

    /// Primary tunnel, else the first one defined
    pub fn primary_or_first(&self) -> Option<TunnelConf> {
        self.find_primary().or_else(|| self.tx.borrow().first().cloned())
    }

    /// Insert or replace a tunnel
    ///
    /// Setting one of the exclusive flags first clears it on every other
    /// tunnel, so the at-most-one invariant holds after every write.
    pub fn save(&self, conf: TunnelConf) -> Result<(), ConfigError> {
        conf.validate()
            .map_err(|message| ConfigError::ValidationError { message })?;

        let mut tunnels = self.all();
        let others: Vec<TunnelConf> = tunnels.iter().filter(|t| t.id != conf.id).cloned().collect();
        check_unique(&others, &conf)?;

        for other in tunnels.iter_mut().filter(|t| t.id != conf.id) {
            if conf.is_primary {
                other.is_primary = false;
            }
            if conf.is_mobile_data_tunnel {
                other.is_mobile_data_tunnel = false;
            }
            if conf.is_ethernet_tunnel {
                other.is_ethernet_tunnel = false;
            }
        }

        match tunnels.iter_mut().find(|t| t.id == conf.id) {
            Some(existing) => *existing = conf,
            None => {
                info!(tunnel = %conf.name, "Adding tunnel");
                tunnels.push(conf);
            }
        }

        self.tx.send_replace(tunnels);
        Ok(())
    }

    /// Remove a tunnel, returning it if it existed
    pub fn delete(&self, id: TunnelId) -> Option<TunnelConf> {
        let mut removed = None;
        self.tx.send_if_modified(|tunnels| {
            match tunnels.iter().position(|t| t.id == id) {
                Some(index) => {
                    removed = Some(tunnels.remove(index));
                    true
                }
                None => false,
            }
        });
        removed
    }

    /// Record whether a tunnel is running
    pub fn set_active(&self, id: TunnelId, active: bool) {
        self.tx.send_if_modified(|tunnels| {
            match tunnels.iter_mut().find(|t| t.id == id) {
                Some(conf) if conf.is_active != active => {
                    conf.is_active = active;
                    true
                }
                _ => false,
            }
        });
    }
}

fn check_unique(existing: &[TunnelConf], conf: &TunnelConf) -> Result<(), ConfigError> {
    if existing.iter().any(|t| t.id == conf.id) {
        return Err(ConfigError::Duplicate {
            field: "id".to_string(),
            value: conf.id.to_string(),
        });
    }
    if existing.iter().any(|t| t.name == conf.name) {
        return Err(ConfigError::Duplicate {
            field: "name".to_string(),
            value: conf.name.clone(),
        });
    }
    Ok(())
}

fn normalise_flags(tunnels: &mut [TunnelConf]) {
    fn keep_first(flag: &mut bool, seen: &mut bool) {
        if *flag {
            *flag = !*seen;
            *seen = true;
        }
    }

    let (mut primary, mut mobile, mut ethernet) = (false, false, false);
    for conf in tunnels.iter_mut() {
        keep_first(&mut conf.is_primary, &mut primary);
        keep_first(&mut conf.is_mobile_data_tunnel, &mut mobile);
        keep_first(&mut conf.is_ethernet_tunnel, &mut ethernet);
    }
}
