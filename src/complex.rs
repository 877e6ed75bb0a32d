//! Raw device encodings and their conversion to normalized complex samples

use byte_slice_cast::{ToByteSlice, ToMutByteSlice};
use num_complex::Complex32;
use num_traits::AsPrimitive;

/// One scalar of an interleaved I/Q frame in a device's native encoding.
pub trait RawSample:
    AsPrimitive<f32> + Default + Send + Sync + ToByteSlice + ToMutByteSlice
{
    /// Linear factor taking this encoding into [-1.0, 1.0]
    const SCALE: f32;
}

impl RawSample for i8 {
    const SCALE: f32 = 1.0 / 127.0;
}

impl RawSample for i16 {
    const SCALE: f32 = 1.0 / 32767.0;
}

// Float devices already deliver normalized values
impl RawSample for f32 {
    const SCALE: f32 = 1.0;
}

/// Convert one raw I/Q pair
#[inline(always)]
pub fn normalize<T: RawSample>(i: T, q: T) -> Complex32 {
    Complex32::new(i.as_() * T::SCALE, q.as_() * T::SCALE)
}

/// Convert interleaved `[I, Q, I, Q, ...]` into `out`, returning how many complex
/// samples were written. A trailing odd scalar is ignored.
pub fn normalize_into<T: RawSample>(raw: &[T], out: &mut [Complex32]) -> usize {
    let n = (raw.len() / 2).min(out.len());
    for (dst, pair) in out[..n].iter_mut().zip(raw.chunks_exact(2)) {
        *dst = normalize(pair[0], pair[1]);
    }
    n
}
