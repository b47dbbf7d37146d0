//! Fault recovery table
//!
//! Maps a [`ServiceFault`] raised in a given context onto the action the
//! engine takes. The table is pure; the engine owns the attempt counters.
//!
//! | Fault                 | Bootstrap / Refresh             | Member mutation            |
//! |-----------------------|---------------------------------|----------------------------|
//! | `FullSyncRequired`    | `RestartFromScratch`            | `Fail`                     |
//! | `AddressBookMissing`  | `CreateAddressBookThenRestart`  | `Fail`                     |
//! | `MemberAlreadyExists` | `Fail`                          | `TreatAsSuccess`           |
//! | `MemberDoesNotExist`  | `Fail`                          | `TreatAsSuccess`           |
//! | `ServiceMissing`      | `Fail`                          | `RegisterServiceThenRetry` |
//! | anything else         | `Fail`                          | `Fail`                     |
//!
//! Restarting actions turn into `Fail` once `attempts` reaches the budget.

use rostersync_core::domain::ServiceFault;

/// Where the fault was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryContext {
    /// Fetching during bootstrap
    Bootstrap,
    /// Fetching after sign-in
    Refresh,
    /// Adding or deleting a list member
    MemberMutation,
    /// Any other remote call
    Other,
}

/// What the engine does about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Discard the cache and start over with full fetches
    RestartFromScratch,
    /// Create the address book, then start over
    CreateAddressBookThenRestart,
    /// Register the missing service, then retry the call
    RegisterServiceThenRetry,
    /// The requested state already holds
    TreatAsSuccess,
    /// Surface the fault and stop
    Fail,
}

/// Decides the recovery action for `fault`
///
/// `attempts` is the number of restarts or retries already performed in the
/// current flow, `max_attempts` the budget.
pub fn decide(
    fault: &ServiceFault,
    context: RecoveryContext,
    attempts: u32,
    max_attempts: u32,
) -> RecoveryAction {
    let fetching = matches!(context, RecoveryContext::Bootstrap | RecoveryContext::Refresh);
    let within_budget = attempts < max_attempts;

    match fault {
        ServiceFault::FullSyncRequired(_) if fetching && within_budget => {
            RecoveryAction::RestartFromScratch
        }
        ServiceFault::AddressBookMissing if fetching && within_budget => {
            RecoveryAction::CreateAddressBookThenRestart
        }
        ServiceFault::MemberAlreadyExists | ServiceFault::MemberDoesNotExist
            if context == RecoveryContext::MemberMutation =>
        {
            RecoveryAction::TreatAsSuccess
        }
        ServiceFault::ServiceMissing
            if context == RecoveryContext::MemberMutation && within_budget =>
        {
            RecoveryAction::RegisterServiceThenRetry
        }
        _ => RecoveryAction::Fail,
    }
}

/// Returns true for faults that a restart can clear
pub fn is_recoverable(fault: &ServiceFault) -> bool {
    matches!(
        fault,
        ServiceFault::FullSyncRequired(_)
            | ServiceFault::AddressBookMissing
            | ServiceFault::ServiceMissing
    )
}
