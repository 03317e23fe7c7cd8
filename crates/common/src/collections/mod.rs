//! Specialized data structures
//!
//! - **[`ring_buffer`]**: Fixed-size ring buffer for bounded telemetry windows

pub mod ring_buffer;

pub use ring_buffer::RingBuffer;
