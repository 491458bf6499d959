//! Lock-free SPSC ring buffer between the microphone callback and the capture loop.
//!
//! Uses `ringbuf::HeapRb<f32>`, whose `push_slice` is wait-free and safe to
//! call from the real-time audio callback.

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the device callback.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the capture loop.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^17 = 131 072 samples ≈ 2.7 s at 48 kHz. Capture drains every few
/// milliseconds, so anything larger only hides a stalled loop.
pub const RING_CAPACITY: usize = 1 << 17;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
