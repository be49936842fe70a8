//! The [`RequirementsWatcher`] contract: an external observer of
//! environment conditions (network, charging, device idle, ...) that
//! reports which of a requested [`Requirements`] set are currently not
//! met, and pushes updates whenever that changes.

use crate::{NotMetRequirements, Requirements};

/// Invoked by a [`RequirementsWatcher`] whenever the not-met mask
/// changes while watching is active.
pub trait RequirementsListener: Send + Sync {
    fn on_requirements_state_changed(&self, not_met: NotMetRequirements);
}

/// Watches environment conditions against a requested [`Requirements`]
/// set.
///
/// `start` both returns the current not-met mask synchronously and
/// begins asynchronous monitoring; subsequent changes are pushed to the
/// registered listener until `stop` is called. Calling `start` again
/// (e.g. because `setRequirements` changed the requested set) replaces
/// both the requested set and the listener's subscription.
pub trait RequirementsWatcher: Send + Sync {
    fn start(
        &self,
        requirements: Requirements,
        listener: std::sync::Arc<dyn RequirementsListener>,
    ) -> NotMetRequirements;

    fn stop(&self);
}
