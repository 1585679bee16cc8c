/// Wallet identity parsing and syntactic address validation
///
/// The proxy never checks address checksums; a validator only has to return
/// a canonical string or say why the input is unusable.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bech32 data charset (lowercase only)
const BECH32_CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address has no '1' separator")]
    MissingSeparator,
    #[error("unknown address prefix '{0}'")]
    UnknownPrefix(String),
    #[error("invalid character '{0}' in address")]
    InvalidCharacter(char),
    #[error("mixed-case address")]
    MixedCase,
    #[error("address payload length {0} out of range")]
    Length(usize),
}

/// Wallet + optional worker suffix under which shares are attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub wallet: String,
    pub worker: Option<String>,
}

impl Identity {
    pub fn new(wallet: impl Into<String>, worker: Option<String>) -> Self {
        Self {
            wallet: wallet.into(),
            worker: worker.filter(|w| !w.is_empty()),
        }
    }

    /// Parse `wallet[.worker]` and validate the wallet part.
    pub fn parse(raw: &str, validator: &dyn AddressValidator) -> Result<Self, AddressError> {
        let (wallet, worker) = split_worker(raw);
        let wallet = validator.validate(wallet)?;
        Ok(Self::new(wallet, worker.map(str::to_string)))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker {
            Some(worker) => write!(f, "{}.{}", self.wallet, worker),
            None => f.write_str(&self.wallet),
        }
    }
}

/// Split a `wallet.worker` login into its parts.
pub fn split_worker(raw: &str) -> (&str, Option<&str>) {
    let raw = raw.trim();
    match raw.split_once('.') {
        Some((wallet, worker)) if !worker.is_empty() => (wallet, Some(worker)),
        Some((wallet, _)) => (wallet, None),
        None => (raw, None),
    }
}

/// External collaborator: canonicalises a raw wallet string or rejects it.
pub trait AddressValidator: Send + Sync {
    fn validate(&self, raw: &str) -> Result<String, AddressError>;
}

/// Checks the human-readable prefix, charset and payload length of a
/// Bech32-style address. Checksums are left to the daemon.
#[derive(Debug, Clone)]
pub struct Bech32AddressValidator {
    prefixes: Vec<String>,
    min_payload: usize,
    max_payload: usize,
}

impl Bech32AddressValidator {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
            min_payload: 20,
            max_payload: 90,
        }
    }
}

impl Default for Bech32AddressValidator {
    fn default() -> Self {
        Self::new(["dero", "deto"])
    }
}

impl AddressValidator for Bech32AddressValidator {
    fn validate(&self, raw: &str) -> Result<String, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        let has_upper = raw.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = raw.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return Err(AddressError::MixedCase);
        }

        let address = raw.to_lowercase();
        let (hrp, payload) = address
            .rsplit_once('1')
            .ok_or(AddressError::MissingSeparator)?;

        if !self.prefixes.iter().any(|p| p == hrp) {
            return Err(AddressError::UnknownPrefix(hrp.to_string()));
        }

        let invalid = payload
            .chars()
            .find(|c| !c.is_ascii() || !BECH32_CHARSET.contains(&(*c as u8)));
        if let Some(bad) = invalid {
            return Err(AddressError::InvalidCharacter(bad));
        }

        if !(self.min_payload..=self.max_payload).contains(&payload.len()) {
            return Err(AddressError::Length(payload.len()));
        }

        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WALLET: &str = "dero1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzp04aq73yheqqg2ctjn4";

    #[test]
    fn test_split_worker() {
        assert_eq!(split_worker("abc.rig1"), ("abc", Some("rig1")));
        assert_eq!(split_worker("abc."), ("abc", None));
        assert_eq!(split_worker(" abc "), ("abc", None));
    }

    #[test]
    fn test_valid_address_is_canonicalised() {
        let validator = Bech32AddressValidator::default();
        assert_eq!(validator.validate(WALLET).unwrap(), WALLET);
        assert_eq!(validator.validate(&WALLET.to_uppercase()).unwrap(), WALLET);
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let validator = Bech32AddressValidator::default();
        assert_eq!(validator.validate("  "), Err(AddressError::Empty));
        assert!(matches!(
            validator.validate("xmr1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzp04aq"),
            Err(AddressError::UnknownPrefix(_))
        ));
        assert!(matches!(validator.validate("dero1qqqqq"), Err(AddressError::Length(5))));
        assert!(matches!(
            validator.validate("dero1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzbbbb"),
            Err(AddressError::InvalidCharacter('b'))
        ));
        assert_eq!(validator.validate("Dero1abc"), Err(AddressError::MixedCase));
    }

    #[test]
    fn test_identity_parse_and_display() {
        let validator = Bech32AddressValidator::default();
        let identity = Identity::parse(&format!("{}.rig7", WALLET), &validator).unwrap();
        assert_eq!(identity.wallet, WALLET);
        assert_eq!(identity.worker.as_deref(), Some("rig7"));
        assert_eq!(identity.to_string(), format!("{}.rig7", WALLET));

        let bare = Identity::new(WALLET, Some(String::new()));
        assert!(bare.worker.is_none());
        assert_eq!(bare.to_string(), WALLET);
    }
}
