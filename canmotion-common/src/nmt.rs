//! Definitions for the NMT state machine

/// Possible NMT states of a node, with the values reported in heartbeat messages
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmtState {
    /// Initialisation
    ///
    /// A node never remains in this state. It is only ever reported by the boot-up message,
    /// after which the node enters PreOperational on its own.
    Initialisation = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operational state, PDOs are exchanged
    Operational = 5,
    /// Node is awaiting command to enter operation. SDO is available, PDO is not.
    PreOperational = 127,
}

impl NmtState {
    /// True if a node in this state may be commanded into `next`
    ///
    /// Any state may be left for Stopped or reset into Initialisation. Initialisation is only
    /// left into PreOperational, which the node does by itself.
    pub fn can_transition_to(&self, next: NmtState) -> bool {
        use NmtState::*;
        match (self, next) {
            (_, Stopped) | (_, Initialisation) => true,
            (Initialisation, PreOperational) => true,
            (Initialisation, Operational) => false,
            (PreOperational | Operational | Stopped, PreOperational | Operational) => true,
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Initialisation => write!(f, "Initialisation"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// An error for [`NmtState::try_from()`]
pub struct InvalidNmtStateError(pub u8);

impl core::fmt::Display for InvalidNmtStateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid NMT state {}", self.0)
    }
}

impl core::error::Error for InvalidNmtStateError {}

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    /// Attempt to convert a u8 to an NmtState enum
    ///
    /// Fails with InvalidNmtStateError if value is not a valid state
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Initialisation as u8 => Ok(Initialisation),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use NmtState::*;
        assert!(Initialisation.can_transition_to(PreOperational));
        assert!(!Initialisation.can_transition_to(Operational));
        assert!(PreOperational.can_transition_to(Operational));
        assert!(Operational.can_transition_to(PreOperational));
        assert!(Operational.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(PreOperational));
        assert!(Stopped.can_transition_to(Initialisation));
    }

    #[test]
    fn test_from_u8() {
        assert_eq!(Ok(NmtState::Operational), NmtState::try_from(5));
        assert_eq!(Err(InvalidNmtStateError(3)), NmtState::try_from(3));
    }
}
