//! Identity profiles and their rotation.

pub mod profiles;
pub mod rotation;

pub use profiles::{default_profiles, IdentityProfile, Viewport};
pub use rotation::{IdentityConfig, IdentityRotationManager, ProfileStats};
