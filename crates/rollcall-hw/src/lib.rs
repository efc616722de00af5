//! rollcall-hw — Camera capture for the attendance scan loop.
//!
//! V4L2-based camera access. The camera is an exclusively owned resource:
//! one scan or enrollment session holds it at a time, and every exit path
//! releases it. Switching cameras is release-then-reacquire, never a live
//! reconfiguration.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
