//! Control-port resolution.
//!
//! Ports from the caller's document win, then ports the manager already
//! holds. Anything still missing gets a fallback: the engine's preferred
//! default when it can be bound on loopback, otherwise a port the OS hands
//! out for `127.0.0.1:0`. A resolved pair is never 0 and never equal.

use crate::CoreError;
use corehub_schema::{ControlPorts, EngineType};
use std::net::TcpListener;
use tracing::debug;

/// Attempts at drawing an OS-assigned port distinct from `avoid`.
const EPHEMERAL_ATTEMPTS: usize = 8;

fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn ephemeral_port() -> Result<u16, CoreError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Pick a usable loopback port, preferring `preferred`, never `avoid`.
pub fn fallback_port(preferred: u16, avoid: Option<u16>) -> Result<u16, CoreError> {
    if preferred != 0 && Some(preferred) != avoid && bindable(preferred) {
        return Ok(preferred);
    }
    for _ in 0..EPHEMERAL_ATTEMPTS {
        let port = ephemeral_port()?;
        if Some(port) != avoid {
            return Ok(port);
        }
    }
    Err(CoreError::InvalidPortRange(
        "no free loopback port available".to_owned(),
    ))
}

/// Resolve the `(socks, api)` pair for a run of `engine`.
pub fn resolve_ports(
    engine: EngineType,
    requested: ControlPorts,
    held: ControlPorts,
) -> Result<(u16, u16), CoreError> {
    let (default_socks, _, default_api) = engine.default_ports();

    let socks = requested.socks.or(held.socks).filter(|p| *p != 0);
    let api = requested.api.or(held.api).filter(|p| *p != 0);

    let (socks, api) = match (socks, api) {
        (Some(s), Some(a)) => (s, a),
        (Some(s), None) => (s, fallback_port(default_api, Some(s))?),
        (None, Some(a)) => (fallback_port(default_socks, Some(a))?, a),
        (None, None) => {
            let s = fallback_port(default_socks, None)?;
            (s, fallback_port(default_api, Some(s))?)
        }
    };

    if socks == api {
        return Err(CoreError::InvalidPortRange(format!(
            "socks and api ports must differ (both {socks})"
        )));
    }
    debug!("resolved ports for {engine}: socks={socks} api={api}");
    Ok((socks, api))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_ports_win_over_held() {
        let resolved = resolve_ports(
            EngineType::Xray,
            ControlPorts::new(20001, 20002),
            ControlPorts::new(30001, 30002),
        )
        .unwrap();
        assert_eq!(resolved, (20001, 20002));
    }

    #[test]
    fn held_ports_fill_gaps_in_request() {
        let requested = ControlPorts {
            socks: Some(20001),
            api: None,
        };
        let resolved =
            resolve_ports(EngineType::Mihomo, requested, ControlPorts::new(30001, 30002)).unwrap();
        assert_eq!(resolved, (20001, 30002));
    }

    #[test]
    fn fallback_ports_are_nonzero_distinct_and_unprivileged() {
        for engine in EngineType::ALL {
            let (socks, api) =
                resolve_ports(engine, ControlPorts::default(), ControlPorts::default()).unwrap();
            assert!(socks >= 1024 && api >= 1024);
            assert_ne!(socks, api);
        }
    }

    #[test]
    fn occupied_default_falls_back_to_ephemeral() {
        let squatter = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = squatter.local_addr().unwrap().port();
        let port = fallback_port(taken, None).unwrap();
        assert_ne!(port, taken);
        assert_ne!(port, 0);
    }

    #[test]
    fn fallback_never_returns_the_avoided_port() {
        let port = fallback_port(25000, Some(25000)).unwrap();
        assert_ne!(port, 25000);
    }

    #[test]
    fn equal_ports_are_rejected() {
        let err = resolve_ports(
            EngineType::Xray,
            ControlPorts::new(20001, 20001),
            ControlPorts::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPortRange(_)));
    }
}
