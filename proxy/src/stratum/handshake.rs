/// Connection lifecycle and login identity resolution

use crate::address::{AddressError, AddressValidator, Identity};
use crate::config::Mode;
use crate::stratum::protocol::LoginParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Socket accepted, nothing read yet
    Accepted,
    /// Waiting for `login`
    Handshaking,
    /// Registered and receiving jobs
    Active,
    /// Unregistering, no further writes
    Closing,
    Closed,
}

/// Decide which identity a new session mines under.
///
/// Solo mode uses the configured identity when there is one; otherwise (and
/// always in pool mode) the login's `wallet[.worker]` is validated, with
/// `rigid` as a fallback worker name.
pub fn resolve_identity(
    login: &LoginParams,
    mode: Mode,
    configured: Option<&Identity>,
    validator: &dyn AddressValidator,
) -> Result<Identity, AddressError> {
    if let (Mode::Solo, Some(identity)) = (mode, configured) {
        return Ok(identity.clone());
    }

    let mut identity = Identity::parse(&login.login, validator)?;
    if identity.worker.is_none() {
        identity = Identity::new(identity.wallet, login.rigid.clone());
    }
    Ok(identity)
}

/// Identity a share is submitted under.
///
/// Solo mode credits every share to the proxy identity: the configured one,
/// else the first registered miner's. Pool mode keeps the session's own.
pub fn share_identity(
    mode: Mode,
    configured: Option<&Identity>,
    first_miner: Option<Identity>,
    session: &Identity,
) -> Identity {
    match mode {
        Mode::Solo => configured
            .cloned()
            .or(first_miner)
            .unwrap_or_else(|| session.clone()),
        Mode::Pool => session.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Bech32AddressValidator;

    const WALLET: &str = "dero1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzp04aq73yheqqg2ctjn4";

    fn login(raw: &str, rigid: Option<&str>) -> LoginParams {
        LoginParams {
            login: raw.to_string(),
            rigid: rigid.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_mode_uses_login() {
        let validator = Bech32AddressValidator::default();
        let configured = Identity::new("dero1configured", None);
        let id = resolve_identity(
            &login(&format!("{}.rig2", WALLET), None),
            Mode::Pool,
            Some(&configured),
            &validator,
        )
        .unwrap();
        assert_eq!(id.wallet, WALLET);
        assert_eq!(id.worker.as_deref(), Some("rig2"));

        let id = resolve_identity(&login(WALLET, Some("gpu0")), Mode::Pool, None, &validator).unwrap();
        assert_eq!(id.worker.as_deref(), Some("gpu0"));

        assert!(resolve_identity(&login("x", None), Mode::Pool, None, &validator).is_err());
    }

    #[test]
    fn test_solo_mode_prefers_configured() {
        let validator = Bech32AddressValidator::default();
        let configured = Identity::new(WALLET, Some("proxy".into()));
        let id = resolve_identity(&login("garbage", None), Mode::Solo, Some(&configured), &validator).unwrap();
        assert_eq!(id, configured);

        let id = resolve_identity(&login(WALLET, None), Mode::Solo, None, &validator).unwrap();
        assert_eq!(id.wallet, WALLET);
    }

    #[test]
    fn test_solo_shares_use_proxy_identity() {
        let configured = Identity::new(WALLET, Some("proxy".into()));
        let first = Identity::new("dero1first", None);
        let second = Identity::new("dero1second", Some("rig".into()));

        assert_eq!(
            share_identity(Mode::Solo, Some(&configured), Some(first.clone()), &second),
            configured
        );
        assert_eq!(share_identity(Mode::Solo, None, Some(first.clone()), &second), first);
        assert_eq!(share_identity(Mode::Solo, None, None, &second), second);
        assert_eq!(share_identity(Mode::Pool, Some(&configured), Some(first), &second), second);
    }
}
