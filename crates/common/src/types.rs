use crate::error::TypeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

pub const MIN_ACCOUNT_LENGTH: usize = 3;
pub const MAX_ACCOUNT_LENGTH: usize = 256;

// --- NewTypes ---

/// Name of an account on the value-transfer ledger.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        let len = name.chars().count();
        if !(MIN_ACCOUNT_LENGTH..=MAX_ACCOUNT_LENGTH).contains(&len) {
            return Err(TypeError::InvalidAccount(format!(
                "length {} outside {}..={}",
                len, MIN_ACCOUNT_LENGTH, MAX_ACCOUNT_LENGTH
            )));
        }
        if !name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(TypeError::InvalidAccount(format!(
                "'{}' contains non-printable or whitespace characters",
                name
            )));
        }
        Ok(AccountId(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccountId::new(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccountId::new(value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

/// Quantity of the fungible asset, in its smallest unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({})", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl FromStr for Amount {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u128>()
            .map(Amount)
            .map_err(|e| TypeError::InvalidAmount(format!("'{}': {}", s, e)))
    }
}

// Amounts travel as decimal strings so JSON clients never lose precision.
impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.0.to_string())
        } else {
            serializer.serialize_u128(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        if !deserializer.is_human_readable() {
            return u128::deserialize(deserializer).map(Amount);
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Amount(n as u128)),
        }
    }
}

/// Threshold predicate over a key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPredicate {
    #[serde(rename = "keys-all")]
    KeysAll,
    #[serde(rename = "keys-any")]
    KeysAny,
    #[serde(rename = "keys-2")]
    Keys2,
}

impl Default for KeyPredicate {
    fn default() -> Self {
        KeyPredicate::KeysAll
    }
}

/// Authorization policy guarding an account: a set of public keys and the
/// number of them that must sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub keys: Vec<String>,
    #[serde(default)]
    pub pred: KeyPredicate,
}

impl KeySet {
    pub fn new(keys: Vec<String>, pred: KeyPredicate) -> Result<Self, TypeError> {
        let keyset = KeySet { keys, pred };
        keyset.validate()?;
        Ok(keyset)
    }

    pub fn validate(&self) -> Result<(), TypeError> {
        if self.keys.is_empty() {
            return Err(TypeError::InvalidKeySet("no keys".to_string()));
        }
        if self.keys.iter().any(|k| k.trim().is_empty()) {
            return Err(TypeError::InvalidKeySet("empty key".to_string()));
        }
        Ok(())
    }

    /// True when `signers` meet this key set's threshold.
    pub fn is_satisfied_by(&self, signers: &[String]) -> bool {
        if self.keys.is_empty() {
            return false;
        }

        let signed: HashSet<&str> = signers.iter().map(String::as_str).collect();
        let matched = self
            .keys
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>()
            .intersection(&signed)
            .count();

        match self.pred {
            KeyPredicate::KeysAll => matched == self.keys.iter().collect::<HashSet<_>>().len(),
            KeyPredicate::KeysAny => matched >= 1,
            KeyPredicate::Keys2 => matched >= 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_validation() {
        assert!(AccountId::new("alice").is_ok());
        assert!(AccountId::new("k:0f9a").is_ok());
        assert!(AccountId::new("ab").is_err());
        assert!(AccountId::new("has space").is_err());
        assert!(AccountId::new("a".repeat(257)).is_err());
        assert!(AccountId::new("a".repeat(256)).is_ok());
    }

    #[test]
    fn test_account_id_serde_rejects_invalid() {
        let ok: AccountId = serde_json::from_str("\"bob-account\"").unwrap();
        assert_eq!(ok.as_str(), "bob-account");

        let err = serde_json::from_str::<AccountId>("\"x\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_amount_json_accepts_string_and_number() {
        let a: Amount = serde_json::from_str("\"340282366920938463463374607431768211455\"").unwrap();
        assert_eq!(a, Amount(u128::MAX));

        let b: Amount = serde_json::from_str("20").unwrap();
        assert_eq!(b, Amount(20));

        assert_eq!(serde_json::to_string(&Amount(100)).unwrap(), "\"100\"");
        assert!(serde_json::from_str::<Amount>("\"-5\"").is_err());
    }

    #[test]
    fn test_amount_arithmetic() {
        assert_eq!(Amount(5).checked_add(Amount(7)), Some(Amount(12)));
        assert_eq!(Amount(u128::MAX).checked_add(Amount(1)), None);
        assert_eq!(Amount(5).checked_sub(Amount(7)), None);
        assert_eq!(Amount(5).saturating_sub(Amount(7)), Amount::ZERO);
    }

    #[test]
    fn test_keyset_predicates() {
        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let one = vec!["k2".to_string()];
        let two = vec!["k1".to_string(), "k3".to_string(), "other".to_string()];
        let all = keys.clone();

        let any = KeySet::new(keys.clone(), KeyPredicate::KeysAny).unwrap();
        assert!(any.is_satisfied_by(&one));
        assert!(!any.is_satisfied_by(&["nobody".to_string()]));

        let k2 = KeySet::new(keys.clone(), KeyPredicate::Keys2).unwrap();
        assert!(!k2.is_satisfied_by(&one));
        assert!(k2.is_satisfied_by(&two));

        let every = KeySet::new(keys, KeyPredicate::KeysAll).unwrap();
        assert!(!every.is_satisfied_by(&two));
        assert!(every.is_satisfied_by(&all));
    }

    #[test]
    fn test_keyset_requires_keys() {
        assert!(KeySet::new(vec![], KeyPredicate::KeysAll).is_err());
        let parsed: KeySet = serde_json::from_str(r#"{"keys":["abc"],"pred":"keys-any"}"#).unwrap();
        assert_eq!(parsed.pred, KeyPredicate::KeysAny);
    }
}
