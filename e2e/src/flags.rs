// Copyright 2024 Oxide Computer Company
use std::collections::BTreeMap;

/// Command line flags for a service, keyed by the flag name including its
/// leading dash (`-ingester.join-after`).
///
/// Ordered so the rendered argument list is stable from run to run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags(BTreeMap<String, String>);

impl Flags {
    pub fn new() -> Flags {
        Flags(BTreeMap::new())
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `overrides` on top of these flags. On a key collision the
    /// override wins.
    pub fn merge(&self, overrides: &Flags) -> Flags {
        let mut merged = self.0.clone();
        for (k, v) in overrides.0.iter() {
            merged.insert(k.clone(), v.clone());
        }
        Flags(merged)
    }

    /// Render as `-key=value` arguments. A flag with an empty value is
    /// passed as the bare key.
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Flags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Flags(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Role defaults overlaid with caller supplied overrides.
pub fn merge_flags(base: &Flags, overrides: &Flags) -> Flags {
    base.merge(overrides)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn override_wins() {
        let base: Flags = [
            ("-ingester.join-after", "0s"),
            ("-ingester.num-tokens", "512"),
        ]
        .into_iter()
        .collect();
        let overrides = Flags::new().with("-ingester.join-after", "10s");

        let merged = merge_flags(&base, &overrides);
        assert_eq!(merged.get("-ingester.join-after"), Some("10s"));
        assert_eq!(merged.get("-ingester.num-tokens"), Some("512"));
        assert_eq!(merged.len(), 2);

        // Inputs are untouched.
        assert_eq!(base.get("-ingester.join-after"), Some("0s"));
    }

    #[test]
    fn args_are_sorted_and_rendered() {
        let flags: Flags = [("-target", "querier"), ("-b", ""), ("-a", "1")]
            .into_iter()
            .collect();
        assert_eq!(
            flags.to_args(),
            vec![
                "-a=1".to_string(),
                "-b".to_string(),
                "-target=querier".to_string()
            ]
        );
    }

    #[test]
    fn empty_merge() {
        let base = Flags::new();
        assert!(merge_flags(&base, &Flags::new()).is_empty());
    }
}
