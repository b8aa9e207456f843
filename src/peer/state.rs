use crate::peer::types::ConnectionState;

/// Transition table for the peer connection state machine.
///
/// `Closed` is absorbing. `Failed` only leaves through a fresh `start()`
/// (back to `Gathering`) or `close()`.
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    if from == Closed {
        return false;
    }
    if to == Closed {
        return true;
    }

    matches!(
        (from, to),
        (Idle, Gathering)
            | (Failed, Gathering)
            | (Gathering, Negotiating)
            | (Gathering, Failed)
            | (Negotiating, Connected)
            | (Negotiating, Failed)
            | (Connected, Reconnecting)
            | (Reconnecting, Connected)
            | (Reconnecting, Failed)
    )
}
