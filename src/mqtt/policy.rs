//! Consolidated fault policy for the MQTT layer
//!
//! Every recoverable failure in the client goes through this table instead of
//! an ad-hoc decision at the call site. Call sites ask for the recovery action
//! and act on it, which keeps raise-versus-log choices in one place.

/// Classes of failure the MQTT layer can encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// A connect attempt failed before a session was established.
    ConnectAttempt,
    /// A live subscribe for a newly added registry entry failed.
    LiveSubscribe,
    /// A live unsubscribe for a removed registry entry failed.
    LiveUnsubscribe,
    /// A replayed subscribe failed during session establishment.
    ReplaySubscribe,
    /// An inbound payload was not a JSON object.
    PayloadDecode,
    /// A message handler returned an error.
    HandlerExecution,
    /// A publish was requested while the client is not connected.
    PublishUnconnected,
    /// The protocol library rejected a publish on a live session.
    PublishProtocol,
    /// The shutdown signal was observed inside a loop.
    Shutdown,
}

/// What the call site does about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Wait the fixed reconnect interval, then try again.
    RetryAfterInterval,
    /// Log and keep going; the operation's effect is skipped.
    LogAndContinue,
    /// Log, publish an error report on the message channel, keep going.
    LogAndReport,
    /// Mark the connection lost and propagate the error to the caller.
    MarkLostAndRaise,
    /// Propagate the error so the current attempt is abandoned cleanly.
    AbortAttempt,
    /// Unwind without error-severity noise.
    SilentUnwind,
}

impl Recovery {
    /// Whether the call site returns the error to its caller.
    pub fn propagates(self) -> bool {
        matches!(self, Recovery::MarkLostAndRaise | Recovery::AbortAttempt)
    }

    /// Whether the failure is reported on the message channel.
    pub fn reports(self) -> bool {
        matches!(self, Recovery::LogAndReport)
    }
}

/// The policy table. One line per fault class.
pub fn recovery_for(fault: Fault) -> Recovery {
    match fault {
        Fault::ConnectAttempt => Recovery::RetryAfterInterval,
        Fault::LiveSubscribe => Recovery::LogAndContinue,
        Fault::LiveUnsubscribe => Recovery::LogAndContinue,
        Fault::ReplaySubscribe => Recovery::AbortAttempt,
        Fault::PayloadDecode => Recovery::LogAndContinue,
        Fault::HandlerExecution => Recovery::LogAndReport,
        Fault::PublishUnconnected => Recovery::LogAndContinue,
        Fault::PublishProtocol => Recovery::MarkLostAndRaise,
        Fault::Shutdown => Recovery::SilentUnwind,
    }
}
