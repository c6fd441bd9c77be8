//! Per-user encoder quality preferences.

use dashmap::DashMap;

use crate::transcode::QualityPreference;
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct PreferenceStore {
    prefs: DashMap<String, QualityPreference>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: &str) -> Option<QualityPreference> {
        self.prefs.get(user).map(|p| p.clone())
    }

    /// Parse `"<preset> <crf>"` and store it. Returns the stored value.
    pub fn set_from_text(&self, user: &str, text: &str) -> Result<QualityPreference> {
        let mut parts = text.split_whitespace();
        let preset = parts.next().unwrap_or_default().to_ascii_lowercase();
        let crf = parts
            .next()
            .and_then(|v| v.parse::<u8>().ok())
            .ok_or_else(|| Error::unsupported("expected '<preset> <crf>', e.g. 'fast 23'"))?;
        let pref = QualityPreference::new(preset.clone(), crf)
            .ok_or_else(|| Error::unsupported(format!("preset '{preset}' with crf {crf}")))?;
        self.prefs.insert(user.to_string(), pref.clone());
        Ok(pref)
    }

    pub fn clear(&self, user: &str) -> Option<QualityPreference> {
        self.prefs.remove(user).map(|(_, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let store = PreferenceStore::new();
        assert!(store.get("u1").is_none());

        let pref = store.set_from_text("u1", "Slow 20").unwrap();
        assert_eq!(pref.preset, "slow");
        assert_eq!(store.get("u1"), Some(pref));
        assert!(store.get("u2").is_none());

        assert!(store.clear("u1").is_some());
        assert!(store.get("u1").is_none());
    }

    #[test]
    fn test_rejects_invalid() {
        let store = PreferenceStore::new();
        assert!(store.set_from_text("u1", "warp 20").is_err());
        assert!(store.set_from_text("u1", "fast 70").is_err());
        assert!(store.set_from_text("u1", "fast").is_err());
        assert!(store.get("u1").is_none());
    }
}
