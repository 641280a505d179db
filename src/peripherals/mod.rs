//! Peripheral handles.
//!
//! Each handle wraps one physical channel of the rig: the rotary encoder
//! module, the reward valve, the light-threshold sensor, and sound output.
//! Handles have no cross-dependencies; bring-up order and calibration
//! gating are the capability manager's job.

pub mod encoder;
pub mod frame2ttl;
pub mod sound;
pub mod valve;
