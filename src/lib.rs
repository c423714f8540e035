//! Indoor pedestrian localization: a particle filter fused with
//! pedestrian dead reckoning (step detection + heading tracking),
//! constrained to a walkable floor map and corrected by optional
//! absolute range/bearing fixes.

pub mod filters;
pub mod live_status;
pub mod map;
pub mod orientation;
pub mod provider;
pub mod sensors;
pub mod step_detector;
pub mod types;

pub use filters::particle::{ParticleFilter, PoseEstimate};
pub use map::WalkableArea;
pub use provider::{
    ClampPolicy, Confidence, LocalizationConfig, LocalizationProvider, PositionUpdate,
    ProviderEvent, ProviderState, StatusEvent,
};
