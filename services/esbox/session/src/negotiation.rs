//! Protocol version negotiation.
//!
//! ```text
//! Unnegotiated --begin_probe / assume_provisionally--> Negotiating --on_peer_version / on_probe_reply--> Established(v)
//!      |                             |                                                 |
//!      +--assume / on_peer_version---+-------------------------------------------------+--close--> Closed
//! ```
//!
//! A prober optimistically frames its probe with the newest version it
//! supports. Once the peer's wrapper arrives the version is fixed for the
//! rest of the session: the declared version if supported, otherwise the
//! configured default.

use crate::error::ProtocolError;
use esbox_wire::ProtocolVersion;
use tracing::{debug, warn};

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No version chosen and no probe sent
    Unnegotiated,
    /// Wrappers are framed with `assumed` until the peer's version is known
    Negotiating {
        /// Version the probe is sent with
        assumed: ProtocolVersion,
    },
    /// Version fixed for the rest of the session
    Established(ProtocolVersion),
    /// Terminal
    Closed,
}

impl NegotiationState {
    fn name(&self) -> &'static str {
        match self {
            NegotiationState::Unnegotiated => "unnegotiated",
            NegotiationState::Negotiating { .. } => "negotiating",
            NegotiationState::Established(_) => "established",
            NegotiationState::Closed => "closed",
        }
    }
}

/// Per-session negotiation state machine
#[derive(Debug, Clone)]
pub struct Negotiator {
    state: NegotiationState,
    /// Oldest first
    supported: Vec<ProtocolVersion>,
    default_version: ProtocolVersion,
}

impl Negotiator {
    /// Create a negotiator. `supported` must contain `default_version`; if it
    /// does not, the default is added.
    pub fn new(mut supported: Vec<ProtocolVersion>, default_version: ProtocolVersion) -> Self {
        if !supported.contains(&default_version) {
            supported.push(default_version);
        }
        supported.sort();
        supported.dedup();
        Self {
            state: NegotiationState::Unnegotiated,
            supported,
            default_version,
        }
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Locally supported versions, oldest first
    pub fn supported(&self) -> &[ProtocolVersion] {
        &self.supported
    }

    /// Configured fallback version
    pub fn default_version(&self) -> ProtocolVersion {
        self.default_version
    }

    /// Established version, if any
    pub fn established(&self) -> Option<ProtocolVersion> {
        match self.state {
            NegotiationState::Established(v) => Some(v),
            _ => None,
        }
    }

    fn newest(&self) -> ProtocolVersion {
        self.supported.last().copied().unwrap_or(self.default_version)
    }

    fn invalid(&self, action: &'static str) -> ProtocolError {
        match self.state {
            NegotiationState::Closed => ProtocolError::Closed,
            state => ProtocolError::InvalidTransition {
                action,
                state: state.name(),
            },
        }
    }

    fn establish(&mut self, version: ProtocolVersion) -> ProtocolVersion {
        debug!("Negotiation {} -> established v{}", self.state.name(), version);
        self.state = NegotiationState::Established(version);
        version
    }

    /// Start a capability probe with the newest supported version.
    /// Returns the version to frame the probe with.
    pub fn begin_probe(&mut self) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Unnegotiated => {
                let assumed = self.newest();
                debug!("Negotiation probing with v{}", assumed);
                self.state = NegotiationState::Negotiating { assumed };
                Ok(assumed)
            }
            _ => Err(self.invalid("begin probe")),
        }
    }

    /// Frame outbound wrappers with `version` until the peer declares its own.
    /// Unsupported versions fall back to the default.
    pub fn assume_provisionally(&mut self, version: ProtocolVersion) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Unnegotiated => {
                let assumed = self.accept(version);
                debug!("Negotiation assuming v{} until the peer answers", assumed);
                self.state = NegotiationState::Negotiating { assumed };
                Ok(assumed)
            }
            _ => Err(self.invalid("assume version")),
        }
    }

    /// Fix a version without probing. Unsupported versions fall back to the default.
    pub fn assume(&mut self, version: ProtocolVersion) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Unnegotiated => Ok(self.establish(self.accept(version))),
            _ => Err(self.invalid("assume version")),
        }
    }

    fn accept(&self, version: ProtocolVersion) -> ProtocolVersion {
        if self.supported.contains(&version) {
            version
        } else {
            warn!(
                "Peer version v{} not supported, falling back to v{}",
                version, self.default_version
            );
            self.default_version
        }
    }

    /// Handle the version declared by an inbound wrapper.
    ///
    /// Before establishment this fixes the session version. Afterwards the
    /// established version is kept and a mismatch is only logged.
    pub fn on_peer_version(&mut self, declared: ProtocolVersion) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Unnegotiated | NegotiationState::Negotiating { .. } => {
                Ok(self.establish(self.accept(declared)))
            }
            NegotiationState::Established(v) => {
                if v != declared {
                    warn!("Peer declared v{} on a session established at v{}", declared, v);
                }
                Ok(v)
            }
            NegotiationState::Closed => Err(ProtocolError::Closed),
        }
    }

    /// Handle a SendSupportedVersions reply: the newest version both sides
    /// support wins, or the default if there is none.
    pub fn on_probe_reply(&mut self, peer_versions: &[ProtocolVersion]) -> Result<ProtocolVersion, ProtocolError> {
        let common = self
            .supported
            .iter()
            .rev()
            .find(|v| peer_versions.contains(v))
            .copied();
        match self.state {
            NegotiationState::Negotiating { .. } | NegotiationState::Unnegotiated => {
                Ok(self.establish(common.unwrap_or(self.default_version)))
            }
            NegotiationState::Established(v) => {
                if common != Some(v) {
                    debug!(
                        "Probe reply suggests {:?}, keeping established v{}",
                        common, v
                    );
                }
                Ok(v)
            }
            NegotiationState::Closed => Err(ProtocolError::Closed),
        }
    }

    /// The probe went unanswered: treat the peer as a baseline device
    pub fn on_probe_unanswered(&mut self) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Negotiating { .. } => Ok(self.establish(self.accept(ProtocolVersion::BASELINE))),
            _ => Err(self.invalid("abandon probe")),
        }
    }

    /// Version to frame the next outbound wrapper with. While a probe is
    /// outstanding that is the assumed version.
    pub fn version_for_encode(&self) -> Result<ProtocolVersion, ProtocolError> {
        match self.state {
            NegotiationState::Established(v) => Ok(v),
            NegotiationState::Negotiating { assumed } => Ok(assumed),
            NegotiationState::Unnegotiated => Err(ProtocolError::NotNegotiated),
            NegotiationState::Closed => Err(ProtocolError::Closed),
        }
    }

    /// Enter the terminal state
    pub fn close(&mut self) {
        if self.state != NegotiationState::Closed {
            debug!("Negotiation {} -> closed", self.state.name());
            self.state = NegotiationState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2_0: ProtocolVersion = ProtocolVersion::new(2, 0);

    fn negotiator() -> Negotiator {
        Negotiator::new(
            vec![ProtocolVersion::V1_0, ProtocolVersion::V1_1],
            ProtocolVersion::V1_0,
        )
    }

    #[test]
    fn test_peer_declares_supported_version() {
        let mut n = negotiator();
        assert_eq!(n.on_peer_version(ProtocolVersion::V1_1), Ok(ProtocolVersion::V1_1));
        assert_eq!(n.state(), NegotiationState::Established(ProtocolVersion::V1_1));
        assert_eq!(n.version_for_encode(), Ok(ProtocolVersion::V1_1));
    }

    #[test]
    fn test_peer_declares_unsupported_version() {
        let mut n = negotiator();
        assert_eq!(n.on_peer_version(V2_0), Ok(ProtocolVersion::V1_0));
        assert_eq!(n.established(), Some(ProtocolVersion::V1_0));
    }

    #[test]
    fn test_echo_after_establishment() {
        let mut n = negotiator();
        n.on_peer_version(ProtocolVersion::V1_1).unwrap();
        assert_eq!(n.on_peer_version(ProtocolVersion::V1_0), Ok(ProtocolVersion::V1_1));
    }

    #[test]
    fn test_probe_flow() {
        let mut n = negotiator();
        assert_eq!(n.version_for_encode(), Err(ProtocolError::NotNegotiated));
        assert_eq!(n.begin_probe(), Ok(ProtocolVersion::V1_1));
        assert_eq!(n.version_for_encode(), Ok(ProtocolVersion::V1_1));
        assert!(n.begin_probe().is_err());

        assert_eq!(
            n.on_probe_reply(&[ProtocolVersion::V1_0, ProtocolVersion::V1_1, V2_0]),
            Ok(ProtocolVersion::V1_1)
        );
        assert_eq!(n.established(), Some(ProtocolVersion::V1_1));
    }

    #[test]
    fn test_probe_reply_without_common_version() {
        let mut n = Negotiator::new(vec![ProtocolVersion::V1_1], ProtocolVersion::V1_1);
        n.begin_probe().unwrap();
        assert_eq!(n.on_probe_reply(&[V2_0]), Ok(ProtocolVersion::V1_1));
    }

    #[test]
    fn test_unanswered_probe_is_baseline() {
        let mut n = negotiator();
        n.begin_probe().unwrap();
        assert_eq!(n.on_probe_unanswered(), Ok(ProtocolVersion::V1_0));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut n = negotiator();
        n.assume(ProtocolVersion::V1_1).unwrap();
        n.close();
        assert_eq!(n.version_for_encode(), Err(ProtocolError::Closed));
        assert_eq!(n.on_peer_version(ProtocolVersion::V1_1), Err(ProtocolError::Closed));
        assert_eq!(n.begin_probe(), Err(ProtocolError::Closed));
        assert_eq!(n.assume(ProtocolVersion::V1_0), Err(ProtocolError::Closed));
        assert_eq!(n.state(), NegotiationState::Closed);
    }

    #[test]
    fn test_provisional_version_yields_to_peer() {
        let mut n = negotiator();
        assert_eq!(n.assume_provisionally(ProtocolVersion::V1_0), Ok(ProtocolVersion::V1_0));
        assert_eq!(n.version_for_encode(), Ok(ProtocolVersion::V1_0));
        assert_eq!(n.established(), None);

        assert_eq!(n.on_peer_version(ProtocolVersion::V1_1), Ok(ProtocolVersion::V1_1));
        assert_eq!(n.established(), Some(ProtocolVersion::V1_1));
        assert!(n.assume_provisionally(ProtocolVersion::V1_0).is_err());
    }

    #[test]
    fn test_default_added_to_supported() {
        let n = Negotiator::new(vec![ProtocolVersion::V1_1], ProtocolVersion::V1_0);
        assert_eq!(n.supported(), &[ProtocolVersion::V1_0, ProtocolVersion::V1_1]);
    }
}
