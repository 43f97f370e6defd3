//! IKE SA lifecycle states
//!
//! ```text
//! Idle ──► InitSent ──► InitDone ──► AuthSent ──► Established ◄──► Rekeying
//!   └──────(responder)──────┘ └────(responder)────────┘
//!
//! any live state ──► Deleting ──► Deleted
//! any live state ──► Failed   ──► Deleted
//! ```

use crate::ipsec::{Error, Result};
use serde::Serialize;
use std::fmt;

/// IKE SA state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IkeSaState {
    /// Created, no exchange yet
    Idle,
    /// IKE_SA_INIT request sent
    InitSent,
    /// IKE_SA_INIT completed
    InitDone,
    /// IKE_AUTH request sent
    AuthSent,
    /// Authenticated and usable
    Established,
    /// IKE SA rekey in progress
    Rekeying,
    /// Delete in progress, waiting on Child SAs or the peer
    Deleting,
    /// Gone; the directory drops it
    Deleted,
    /// Negotiation failed
    Failed,
}

impl IkeSaState {
    /// Check whether `next` is a legal successor
    pub fn can_transition_to(self, next: IkeSaState) -> bool {
        use IkeSaState::*;

        if self == next {
            return !self.is_terminal();
        }
        match (self, next) {
            (Idle, InitSent) | (Idle, InitDone) => true,
            (InitSent, InitDone) => true,
            (InitDone, AuthSent) | (InitDone, Established) => true,
            (AuthSent, Established) => true,
            (Established, Rekeying) | (Rekeying, Established) => true,
            (Deleting, Deleted) | (Failed, Deleted) => true,
            (from, Deleting) | (from, Failed) => !from.is_terminal() && from != Failed,
            _ => false,
        }
    }

    /// Not yet authenticated and still alive
    pub fn is_half_open(self) -> bool {
        matches!(
            self,
            IkeSaState::Idle | IkeSaState::InitSent | IkeSaState::InitDone | IkeSaState::AuthSent
        )
    }

    /// Usable for Child SA negotiation
    pub fn is_established(self) -> bool {
        matches!(self, IkeSaState::Established | IkeSaState::Rekeying)
    }

    /// No further transitions possible
    pub fn is_terminal(self) -> bool {
        matches!(self, IkeSaState::Deleted)
    }
}

impl fmt::Display for IkeSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IkeSaState::Idle => "IDLE",
            IkeSaState::InitSent => "INIT_SENT",
            IkeSaState::InitDone => "INIT_DONE",
            IkeSaState::AuthSent => "AUTH_SENT",
            IkeSaState::Established => "ESTABLISHED",
            IkeSaState::Rekeying => "REKEYING",
            IkeSaState::Deleting => "DELETING",
            IkeSaState::Deleted => "DELETED",
            IkeSaState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// State plus message-ID bookkeeping of one IKE SA
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: IkeSaState,
    next_request_id: u32,
    expected_peer_id: u32,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine {
            state: IkeSaState::Idle,
            next_request_id: 0,
            expected_peer_id: 0,
        }
    }
}

impl StateMachine {
    /// Current state
    pub fn state(&self) -> IkeSaState {
        self.state
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: IkeSaState) -> Result<IkeSaState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "{} -> {} not allowed",
                self.state, next
            )));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Allocate the message ID of our next request
    pub fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Accept a peer request, enforcing in-order message IDs
    pub fn accept_request(&mut self, message_id: u32) -> Result<()> {
        if message_id != self.expected_peer_id {
            return Err(Error::InvalidMessage(format!(
                "Unexpected message ID {}, expected {}",
                message_id, self.expected_peer_id
            )));
        }
        self.expected_peer_id = self.expected_peer_id.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IkeSaState::*;

    #[test]
    fn test_initiator_path() {
        let mut sm = StateMachine::default();
        for next in [InitSent, InitDone, AuthSent, Established, Rekeying, Established] {
            sm.transition(next).unwrap();
        }
        assert_eq!(sm.state(), Established);
    }

    #[test]
    fn test_responder_path() {
        let mut sm = StateMachine::default();
        sm.transition(InitDone).unwrap();
        assert_eq!(sm.transition(Established).unwrap(), InitDone);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Idle.can_transition_to(Established));
        assert!(!Established.can_transition_to(InitSent));
        assert!(!Deleted.can_transition_to(Deleting));
        assert!(!Deleted.can_transition_to(Deleted));
        assert!(!Failed.can_transition_to(Deleting));
        assert!(Failed.can_transition_to(Deleted));

        let mut sm = StateMachine::default();
        assert!(matches!(
            sm.transition(AuthSent),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(sm.state(), Idle);
    }

    #[test]
    fn test_delete_and_fail_from_live_states() {
        for state in [Idle, InitSent, InitDone, AuthSent, Established, Rekeying] {
            assert!(state.can_transition_to(Deleting));
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_half_open() {
        assert!(Idle.is_half_open());
        assert!(AuthSent.is_half_open());
        assert!(!Established.is_half_open());
        assert!(!Failed.is_half_open());
        assert!(!Deleting.is_half_open());
    }

    #[test]
    fn test_message_ids() {
        let mut sm = StateMachine::default();
        assert_eq!(sm.next_request_id(), 0);
        assert_eq!(sm.next_request_id(), 1);

        sm.accept_request(0).unwrap();
        assert!(sm.accept_request(0).is_err());
        sm.accept_request(1).unwrap();
    }

    #[test]
    fn test_display() {
        assert_eq!(InitDone.to_string(), "INIT_DONE");
    }
}
