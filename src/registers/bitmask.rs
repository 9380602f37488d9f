//! Keyed bitmask dictionary.
//!
//! Maps condition keys to register bitmasks. Bitmask values are unique within one
//! dictionary so two condition names can never alias the same bits. The
//! dictionary also keeps an `All` aggregate (the OR of every mask not excluded
//! from it) and a cached `status` scalar.
//!
//! The cached status belongs to the connection that owns the dictionary. It is
//! written only by that connection's poll and read operations (see
//! [`crate::session::TspSession`]); the explicit `*_in` methods take the status as
//! an argument and should be preferred wherever the caller already holds a sample.

use crate::error::{TspError, TspResult};
use std::fmt::Debug;
use std::hash::Hash;

/// Key → bitmask dictionary for one register.
#[derive(Debug, Clone)]
pub struct BitmaskDictionary<K> {
    entries: Vec<(K, u32)>,
    all: u32,
    status: u32,
}

impl<K> Default for BitmaskDictionary<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            all: 0,
            status: 0,
        }
    }
}

impl<K> BitmaskDictionary<K>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` with `bitmask` and fold it into the `All` aggregate.
    ///
    /// # Errors
    /// - `DuplicateBitmask` if another key already uses the same bitmask value
    /// - `InvalidOperation` if `key` is already present or `bitmask` is zero
    pub fn add(&mut self, key: K, bitmask: u32) -> TspResult<()> {
        self.insert(key, bitmask, false)
    }

    /// Register `key` with `bitmask` without contributing to `All`.
    pub fn add_excluded(&mut self, key: K, bitmask: u32) -> TspResult<()> {
        self.insert(key, bitmask, true)
    }

    fn insert(&mut self, key: K, bitmask: u32, exclude_from_all: bool) -> TspResult<()> {
        if bitmask == 0 {
            return Err(TspError::InvalidOperation(format!(
                "Bitmask for {:?} must be non-zero",
                key
            )));
        }
        if let Some((existing, _)) = self.entries.iter().find(|(_, mask)| *mask == bitmask) {
            return Err(TspError::DuplicateBitmask {
                key: format!("{:?}", key),
                existing: format!("{:?}", existing),
                bitmask,
            });
        }
        if self.contains(key) {
            return Err(TspError::InvalidOperation(format!(
                "Key {:?} is already registered",
                key
            )));
        }

        self.entries.push((key, bitmask));
        if !exclude_from_all {
            self.all |= bitmask;
        }
        Ok(())
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: K) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// Bitmask registered for `key`.
    pub fn bitmask(&self, key: K) -> TspResult<u32> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, mask)| *mask)
            .ok_or_else(|| TspError::UnknownKey(format!("{:?}", key)))
    }

    /// OR of every registered mask not excluded from the aggregate.
    pub fn all(&self) -> u32 {
        self.all
    }

    /// OR of the bitmasks for `keys`.
    pub fn combine(&self, keys: &[K]) -> TspResult<u32> {
        keys.iter()
            .try_fold(0u32, |acc, key| Ok(acc | self.bitmask(*key)?))
    }

    /// `status & dict[key]`.
    pub fn masked_value_in(&self, status: u32, key: K) -> TspResult<u32> {
        Ok(status & self.bitmask(key)?)
    }

    /// True if any bit of `key` is on in `status`.
    pub fn is_any_bit_on_in(&self, status: u32, key: K) -> TspResult<bool> {
        Ok(self.masked_value_in(status, key)? != 0)
    }

    /// True if every bit of `key` is on in `status`.
    pub fn are_all_bits_on_in(&self, status: u32, key: K) -> TspResult<bool> {
        let mask = self.bitmask(key)?;
        Ok(status & mask == mask)
    }

    /// Masked value against the cached status.
    pub fn masked_value(&self, key: K) -> TspResult<u32> {
        self.masked_value_in(self.status, key)
    }

    /// Any-bit test against the cached status.
    pub fn is_any_bit_on(&self, key: K) -> TspResult<bool> {
        self.is_any_bit_on_in(self.status, key)
    }

    /// All-bits test against the cached status.
    pub fn are_all_bits_on(&self, key: K) -> TspResult<bool> {
        self.are_all_bits_on_in(self.status, key)
    }

    /// Last sampled register value.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Record a freshly sampled register value.
    pub fn set_status(&mut self, status: u32) {
        self.status = status;
    }

    /// Keys whose bits are on in `status`, in registration order.
    pub fn active_keys(&self, status: u32) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, mask)| status & mask != 0)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.iter().map(|(key, _)| *key)
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Bit {
        A,
        B,
        C,
        Wide,
    }

    fn dict() -> BitmaskDictionary<Bit> {
        let mut dict = BitmaskDictionary::new();
        dict.add(Bit::A, 0x01).unwrap();
        dict.add(Bit::B, 0x04).unwrap();
        dict.add_excluded(Bit::C, 0x40).unwrap();
        dict
    }

    #[test]
    fn test_duplicate_bitmask_rejected() {
        let mut dict = dict();
        let err = dict.add(Bit::Wide, 0x04).unwrap_err();
        assert!(matches!(err, TspError::DuplicateBitmask { bitmask: 0x04, .. }));
        assert!(!dict.contains(Bit::Wide));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut dict = dict();
        assert!(dict.add(Bit::A, 0x80).is_err());
    }

    #[test]
    fn test_all_excludes_flagged_masks() {
        let dict = dict();
        assert_eq!(dict.all(), 0x05);
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn test_masked_value_matches_and() {
        let mut dict = dict();
        dict.add(Bit::Wide, 0x30).unwrap();
        for status in 0u32..=0xFF {
            for key in [Bit::A, Bit::B, Bit::C, Bit::Wide] {
                let mask = dict.bitmask(key).unwrap();
                let masked = dict.masked_value_in(status, key).unwrap();
                assert_eq!(masked, status & mask);
                assert_eq!(dict.is_any_bit_on_in(status, key).unwrap(), masked != 0);
                assert_eq!(dict.are_all_bits_on_in(status, key).unwrap(), masked == mask);
            }
        }
    }

    #[test]
    fn test_unknown_key() {
        let dict = dict();
        let err = dict.is_any_bit_on_in(0xFF, Bit::Wide).unwrap_err();
        assert!(matches!(err, TspError::UnknownKey(_)));
    }

    #[test]
    fn test_cached_status_overloads() {
        let mut dict = dict();
        assert!(!dict.is_any_bit_on(Bit::B).unwrap());
        dict.set_status(0x44);
        assert!(dict.is_any_bit_on(Bit::B).unwrap());
        assert!(dict.is_any_bit_on(Bit::C).unwrap());
        assert!(!dict.is_any_bit_on(Bit::A).unwrap());
        assert_eq!(dict.active_keys(dict.status()), vec![Bit::B, Bit::C]);
    }

    #[test]
    fn test_combine() {
        let dict = dict();
        assert_eq!(dict.combine(&[Bit::A, Bit::C]).unwrap(), 0x41);
        assert!(dict.combine(&[Bit::Wide]).is_err());
    }
}
