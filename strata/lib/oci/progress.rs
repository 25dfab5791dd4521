//! Progress reporting for image materializations.

use std::fmt;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle phase of a materialization, as reported to the status
/// collector. The set is closed; collaborators switch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Fetching the manifest and layers from a registry.
    Pulling,
    /// Loading layers from a local save archive.
    Loading,
    /// Inspecting the materialized image.
    Examination,
    /// Converting the image to a packaged filesystem format.
    Conversion,
    /// Transferring the converted image to a compute platform.
    Transfer,
    /// The image is ready for use.
    Ready,
    /// The materialization failed; terminal.
    Failure,
    /// The image is being expired.
    Expiring,
    /// The image has been expired; terminal.
    Expired,
}

/// A collaborator that receives phase/message updates as a materialization
/// progresses. Invoked synchronously from the orchestrator, so
/// implementations must not block.
pub trait StatusUpdater: Send + Sync {
    /// Records a state transition or progress message.
    fn update_status(&self, phase: Phase, message: &str);
}

/// A status updater that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUpdater;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pulling => "PULLING",
            Phase::Loading => "LOADING",
            Phase::Examination => "EXAMINATION",
            Phase::Conversion => "CONVERSION",
            Phase::Transfer => "TRANSFER",
            Phase::Ready => "READY",
            Phase::Failure => "FAILURE",
            Phase::Expiring => "EXPIRING",
            Phase::Expired => "EXPIRED",
        };
        write!(f, "{name}")
    }
}

impl StatusUpdater for NullUpdater {
    fn update_status(&self, _phase: Phase, _message: &str) {}
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
