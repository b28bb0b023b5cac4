use crate::{Result, TracekitError};
use std::collections::HashMap;
use std::fmt;

/// Raw key/value access to a kernel table
pub trait RawTable {
    /// Every entry of table `name` as raw key and value bytes
    fn raw_entries(&self, name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

pub const COUNTER_KEY_LEN: usize = 4;
pub const COUNTER_VALUE_LEN: usize = 8;

/// Point-in-time copy of a counter table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    inner: HashMap<u32, u64>,
}

impl CounterSnapshot {
    pub fn get(&self, key: &u32) -> Option<u64> {
        self.inner.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Non-zero entries sorted by key
    pub fn non_zero(&self) -> Vec<(u32, u64)> {
        let mut entries: Vec<_> = self
            .inner
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| (*k, *v))
            .collect();
        entries.sort_unstable_by_key(|(k, _)| *k);
        entries
    }

    pub fn total(&self) -> u64 {
        self.inner.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

impl FromIterator<(u32, u64)> for CounterSnapshot {
    fn from_iter<I: IntoIterator<Item = (u32, u64)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.non_zero().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Copy every entry of a `u32 -> u64` counter table
///
/// Keys and values are host-order. Zero counters are kept.
pub fn snapshot<T: RawTable + ?Sized>(table: &T, name: &str) -> Result<CounterSnapshot> {
    let entries = table.raw_entries(name)?;
    let mut inner = HashMap::with_capacity(entries.len());

    for (key, value) in entries {
        let key: [u8; COUNTER_KEY_LEN] = fixed_width(name, "key", &key)?;
        let value: [u8; COUNTER_VALUE_LEN] = fixed_width(name, "value", &value)?;
        inner.insert(u32::from_ne_bytes(key), u64::from_ne_bytes(value));
    }

    Ok(CounterSnapshot { inner })
}

fn fixed_width<const N: usize>(table: &str, field: &str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| TracekitError::Table {
        table: table.to_string(),
        reason: format!("{} is {} bytes, expected {}", field, bytes.len(), N),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTable(Vec<(Vec<u8>, Vec<u8>)>);

    impl RawTable for FixedTable {
        fn raw_entries(&self, name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            if name != "dropcnt" {
                return Err(TracekitError::Table {
                    table: name.to_string(),
                    reason: "not found".to_string(),
                });
            }
            Ok(self.0.clone())
        }
    }

    fn entry(k: u32, v: u64) -> (Vec<u8>, Vec<u8>) {
        (k.to_ne_bytes().to_vec(), v.to_ne_bytes().to_vec())
    }

    #[test]
    fn test_snapshot_keeps_zero_counters() {
        let table = FixedTable(vec![entry(6, 120), entry(17, 0), entry(1, 45)]);
        let snapshot = snapshot(&table, "dropcnt").unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(&6), Some(120));
        assert_eq!(snapshot.get(&17), Some(0));
        assert_eq!(snapshot.get(&1), Some(45));
        assert_eq!(snapshot.total(), 165);
    }

    #[test]
    fn test_display_filter_drops_zero_counters() {
        let table = FixedTable(vec![entry(6, 120), entry(17, 0), entry(1, 45)]);
        let snapshot = snapshot(&table, "dropcnt").unwrap();

        assert_eq!(snapshot.non_zero(), vec![(1, 45), (6, 120)]);
        assert_eq!(snapshot.to_string(), "{1:45, 6:120}");
    }

    #[test]
    fn test_empty_table() {
        let snapshot = snapshot(&FixedTable(Vec::new()), "dropcnt").unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.to_string(), "{}");
    }

    #[test]
    fn test_wrong_value_width_names_table() {
        let table = FixedTable(vec![(6u32.to_ne_bytes().to_vec(), vec![1, 2, 3, 4])]);
        let err = snapshot(&table, "dropcnt").unwrap_err();

        let message = err.to_string();
        assert!(message.contains("dropcnt"));
        assert!(message.contains("value is 4 bytes, expected 8"));
    }

    #[test]
    fn test_missing_table_propagates() {
        let err = snapshot(&FixedTable(Vec::new()), "nope").unwrap_err();
        assert!(matches!(err, TracekitError::Table { table, .. } if table == "nope"));
    }
}
