//! Audio capture and streaming.
//!
//! # Components
//!
//! - [`codec`] - codec contract, datagram pool and the host PCM codec
//! - [`capture`] - double-buffer event routing and the synthetic tone source
//! - [`signal`] - coalescing wake-up from codec to sender worker
//! - [`pipeline`] - session lifecycle and the sender worker

pub mod capture;
pub mod codec;
pub mod pipeline;
pub mod signal;

pub use capture::{CaptureError, CaptureEvent, CaptureHandler, CaptureSource, ToneCapture};
pub use codec::{Codec, CodecEvents, Datagram, DatagramPool, PcmCodec};
pub use pipeline::{AudioPipeline, PipelineDeps, SessionEnd, SessionState, StartError};
pub use signal::{ready_signal, ReadyNotifier, ReadyWaiter};
