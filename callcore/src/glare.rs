//! Deterministic resolution of simultaneous offers.
//!
//! When both participants offer at the same time each side sees the other's
//! offer while still `Offering`. Both sides run the same comparison on the
//! same pair of identities, so exactly one of them yields.

use crate::types::call::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Our offer stands; the incoming one is ignored.
    KeepLocal,
    /// Drop our attempt silently and answer the incoming offer.
    YieldToRemote,
}

/// The lower identity's offer wins.
///
/// Identical identities can only come from a misconfigured pair; both sides
/// keep their own offer and the attempt runs into the connect timeout.
pub fn resolve_glare(local: &UserId, remote: &UserId) -> GlareOutcome {
    if local <= remote {
        GlareOutcome::KeepLocal
    } else {
        GlareOutcome::YieldToRemote
    }
}
