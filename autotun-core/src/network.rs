//! Network condition snapshots
//!
//! A `NetworkState` is produced by whatever watches the platform's
//! connectivity and is consumed whole: every emission supersedes the previous
//! one, nothing is merged.

use serde::{Deserialize, Serialize};

/// Snapshot of the device's network conditions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub wifi_connected: bool,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub is_ethernet_connected: bool,
    #[serde(default)]
    pub is_mobile_data_connected: bool,
    #[serde(default)]
    pub has_internet: bool,
}

impl NetworkState {
    /// Wi-Fi connected to the given SSID with internet access
    pub fn wifi(ssid: &str) -> Self {
        Self {
            wifi_connected: true,
            ssid: Some(ssid.to_string()),
            has_internet: true,
            ..Self::default()
        }
    }

    /// Ethernet attached with internet access
    pub fn ethernet() -> Self {
        Self {
            is_ethernet_connected: true,
            has_internet: true,
            ..Self::default()
        }
    }

    /// Mobile data attached with internet access
    pub fn mobile_data() -> Self {
        Self {
            is_mobile_data_connected: true,
            has_internet: true,
            ..Self::default()
        }
    }

    /// No link of any kind
    pub fn is_disconnected(&self) -> bool {
        !self.wifi_connected && !self.is_ethernet_connected && !self.is_mobile_data_connected
    }
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut links = Vec::new();
        if self.wifi_connected {
            links.push(format!(
                "wifi({})",
                self.ssid.as_deref().unwrap_or("<unknown>")
            ));
        }
        if self.is_ethernet_connected {
            links.push("ethernet".to_string());
        }
        if self.is_mobile_data_connected {
            links.push("mobile".to_string());
        }
        if links.is_empty() {
            links.push("offline".to_string());
        }
        let internet = if self.has_internet { "" } else { " no-internet" };
        write!(f, "{}{}", links.join("+"), internet)
    }
}

/// How an SSID matched a configured network name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SsidMatch {
    Exact,
    Wildcard,
}

/// Match one configured network name against an SSID
///
/// `*` matches any run of characters and `?` a single one; patterns are only
/// honoured when `wildcards` is set, otherwise the comparison is literal.
pub fn match_ssid(pattern: &str, ssid: &str, wildcards: bool) -> Option<SsidMatch> {
    if pattern == ssid {
        return Some(SsidMatch::Exact);
    }
    if wildcards && (pattern.contains('*') || pattern.contains('?')) && glob_match(pattern, ssid) {
        return Some(SsidMatch::Wildcard);
    }
    None
}

/// Best match of an SSID against a set of configured network names
pub fn best_match<'a, I>(patterns: I, ssid: &str, wildcards: bool) -> Option<SsidMatch>
where
    I: IntoIterator<Item = &'a String>,
{
    patterns
        .into_iter()
        .filter_map(|pattern| match_ssid(pattern, ssid, wildcards))
        .min()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some(p);
                resume = t;
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some(star_at) => {
                    p = star_at + 1;
                    resume += 1;
                    t = resume;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}
