//! Integration tests for the roster engine
//!
//! Drives `RosterEngine` against in-memory fakes of the membership service,
//! the notification channel and the roster store, and verifies bootstrap,
//! acknowledgment, mutation, refresh and sign-off behavior end to end.

mod common;

mod test_acknowledgment;
mod test_mutation;
mod test_sign_off;
