//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod mock;
pub mod sink;

pub use buffer::{Consumer, Producer, RingBuffer};
pub use capture::{AudioCapture, CpalCapture};
pub use device::{find_input_device, list_input_devices, InputDeviceInfo};
pub use mock::{MockCapture, MockCaptureHandle};
pub use sink::{AudioSink, SinkOpener, WavSinkOpener};
