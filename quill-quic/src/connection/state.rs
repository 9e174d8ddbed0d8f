use super::ConnectionError;

/// Connection lifecycle: awaiting parameters, established, closing, closed
///
/// Nested [`InnerState`] to enforce all state transitions are done in this
/// module.
#[derive(Debug, Clone)]
pub(super) struct State {
    inner: InnerState,
}

#[derive(Debug, Clone)]
enum InnerState {
    /// Transport parameter negotiation has not completed yet
    AwaitingTransportParameters,
    /// Both parameter sets are known; application traffic may flow
    Established,
    /// A terminal error occurred; the close is being flushed
    Closing { error: ConnectionError },
    /// The close has been flushed; nothing further leaves this connection
    Closed { error: ConnectionError },
}

impl State {
    pub(super) fn new() -> Self {
        Self {
            inner: InnerState::AwaitingTransportParameters,
        }
    }

    pub(super) fn is_established(&self) -> bool {
        matches!(self.inner, InnerState::Established)
    }

    pub(super) fn is_closed(&self) -> bool {
        matches!(self.inner, InnerState::Closed { .. })
    }

    /// Whether packets may still be processed
    pub(super) fn is_active(&self) -> bool {
        matches!(
            self.inner,
            InnerState::AwaitingTransportParameters | InnerState::Established
        )
    }

    pub(super) fn error(&self) -> Option<&ConnectionError> {
        match self.inner {
            InnerState::Closing { ref error } | InnerState::Closed { ref error } => Some(error),
            _ => None,
        }
    }

    pub(super) fn move_to_established(&mut self) {
        debug_assert!(
            matches!(self.inner, InnerState::AwaitingTransportParameters),
            "transport parameters negotiated twice"
        );
        self.inner = InnerState::Established;
    }

    /// Record the terminal error; returns `false` if one was already recorded
    pub(super) fn move_to_closing(&mut self, error: ConnectionError) -> bool {
        if !self.is_active() {
            return false;
        }
        self.inner = InnerState::Closing { error };
        true
    }

    pub(super) fn move_to_closed(&mut self) {
        let error = match self.inner {
            InnerState::Closing { ref error } | InnerState::Closed { ref error } => error.clone(),
            _ => ConnectionError::LocallyClosed,
        };
        self.inner = InnerState::Closed { error };
    }
}
