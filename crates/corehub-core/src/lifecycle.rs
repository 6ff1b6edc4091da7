use crate::CoreError;
use corehub_schema::EngineType;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "engine")]
pub enum ManagerState {
    Stopped,
    Running(EngineType),
}

impl ManagerState {
    pub fn is_running(self) -> bool {
        matches!(self, ManagerState::Running(_))
    }

    pub fn engine(self) -> Option<EngineType> {
        match self {
            ManagerState::Running(engine) => Some(engine),
            ManagerState::Stopped => None,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Stopped => f.write_str("stopped"),
            ManagerState::Running(engine) => write!(f, "running({engine})"),
        }
    }
}

/// Every engine change passes through `Stopped`: a running engine is never
/// replaced in place.
pub fn validate_transition(from: ManagerState, to: ManagerState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ManagerState::Stopped, _) | (ManagerState::Running(_), ManagerState::Stopped)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XRAY: ManagerState = ManagerState::Running(EngineType::Xray);
    const MIHOMO: ManagerState = ManagerState::Running(EngineType::Mihomo);

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(ManagerState::Stopped, XRAY).is_ok());
        assert!(validate_transition(ManagerState::Stopped, MIHOMO).is_ok());
        assert!(validate_transition(XRAY, ManagerState::Stopped).is_ok());
        assert!(validate_transition(MIHOMO, ManagerState::Stopped).is_ok());
        assert!(validate_transition(ManagerState::Stopped, ManagerState::Stopped).is_ok()); // idempotent stop
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(XRAY, MIHOMO).is_err());
        assert!(validate_transition(MIHOMO, XRAY).is_err());
        assert!(validate_transition(XRAY, XRAY).is_err());
    }

    #[test]
    fn display_names_the_engine() {
        assert_eq!(ManagerState::Stopped.to_string(), "stopped");
        assert_eq!(MIHOMO.to_string(), "running(mihomo)");
        let err = validate_transition(XRAY, MIHOMO).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition: running(xray) -> running(mihomo)"
        );
    }
}
