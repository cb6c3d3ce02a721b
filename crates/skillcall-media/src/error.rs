use std::time::Duration;

use thiserror::Error;

use crate::{TrackKind, TrackSource};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or OS refused access to the device.
    #[error("permission denied for {0}")]
    PermissionDenied(TrackSource),

    #[error("{0} is not available")]
    DeviceUnavailable(TrackSource),

    #[error("media acquisition did not finish within {0:?}")]
    AcquireTimeout(Duration),

    #[error("constraints request neither audio nor video")]
    EmptyConstraints,

    #[error("no local stream has been acquired")]
    NotAcquired,

    #[error("local stream has no {0:?} track")]
    TrackMissing(TrackKind),
}
