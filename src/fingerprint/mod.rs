//! Fingerprint profiles and countermeasure payload rendering.
//!
//! A profile bundles the spoofed browser identity a session presents:
//! user agent, navigator property overrides, WebGL/canvas noise parameters,
//! viewport, locale and timezone. The catalog is read-only at runtime;
//! selection is uniform random with optional constraints, and payload
//! rendering is pure so a session can be reproduced from its profile.

mod payload;
mod profile;

pub use payload::{extra_headers, render_injection_payload};
pub use profile::{FingerprintError, FingerprintProfile, ProfileCatalog, ProfileConstraints, Viewport};
