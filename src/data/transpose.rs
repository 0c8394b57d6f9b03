#![allow(unsafe_code)]
//! 4x4 block transpose from `[channel][subband][stokes]` to `[subband][stokes][channel]`.
//!
//! The hot path works on tiles of four channels by four Stokes values. On x86_64 each
//! tile is four SSE loads, the classic unpack/move shuffle, and four SSE stores. The
//! 16-byte alignment of the two base pointers is checked once per call and selects
//! one of four monomorphized loop bodies, so the inner loop carries no alignment
//! branches. Because `nchannels` is a multiple of four, every tile row is aligned
//! whenever its base pointer is.
//!
//! The portable path moves one element at a time and produces bit-identical output.

use crate::data::heap::STOKES;
use thiserror::Error;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{
    __m128, _mm_load_ps, _mm_loadu_ps, _mm_movehl_ps, _mm_movelh_ps, _mm_store_ps,
    _mm_storeu_ps, _mm_unpackhi_ps, _mm_unpacklo_ps,
};

/// Shape or buffer errors for [`transpose`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransposeError {
    /// Channel count not divisible into 4-channel tiles
    #[error("Channel count {0} is not a multiple of 4")]
    ChannelsNotMultipleOfFour(usize),
    /// `nchannels * nsubbands * 4` does not fit in `usize`
    #[error("Shape {nchannels} x {nsubbands} x 4 overflows")]
    ShapeOverflow {
        /// Channels per subband
        nchannels: usize,
        /// Subbands
        nsubbands: usize,
    },
    /// Input holds fewer than `nchannels * nsubbands * 4` values
    #[error("Input holds {got} values, shape requires {needed}")]
    InputTooShort {
        /// Required length
        needed: usize,
        /// Actual length
        got: usize,
    },
    /// Output holds fewer than `nchannels * nsubbands * 4` values
    #[error("Output holds {got} values, shape requires {needed}")]
    OutputTooShort {
        /// Required length
        needed: usize,
        /// Actual length
        got: usize,
    },
}

/// Which implementation a call may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransposePath {
    /// SIMD when the CPU has it, portable otherwise
    #[default]
    Auto,
    /// Element-by-element loop
    Portable,
}

/// Loop body chosen for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Both base pointers 16-byte aligned
    BothAligned,
    /// Only the input is aligned
    InputAligned,
    /// Only the output is aligned
    OutputAligned,
    /// Neither is aligned
    Unaligned,
    /// Element-by-element fallback
    Portable,
}

/// Kernel [`transpose`] would run for these buffers.
pub fn select_kernel(path: TransposePath, input: &[f32], output: &[f32]) -> Kernel {
    if path == TransposePath::Portable || !cfg!(target_arch = "x86_64") {
        return Kernel::Portable;
    }
    let in_aligned = input.as_ptr() as usize % 16 == 0;
    let out_aligned = output.as_ptr() as usize % 16 == 0;
    match (in_aligned, out_aligned) {
        (true, true) => Kernel::BothAligned,
        (true, false) => Kernel::InputAligned,
        (false, true) => Kernel::OutputAligned,
        (false, false) => Kernel::Unaligned,
    }
}

/// Transpose with the fastest available kernel.
pub fn transpose(
    input: &[f32],
    output: &mut [f32],
    nchannels: usize,
    nsubbands: usize,
) -> Result<Kernel, TransposeError> {
    transpose_with(TransposePath::Auto, input, output, nchannels, nsubbands)
}

/// Transpose `input` (`[channel][subband][stokes]`) into `output`
/// (`[subband][stokes][channel]`) and report the kernel that ran.
pub fn transpose_with(
    path: TransposePath,
    input: &[f32],
    output: &mut [f32],
    nchannels: usize,
    nsubbands: usize,
) -> Result<Kernel, TransposeError> {
    if nchannels % 4 != 0 {
        return Err(TransposeError::ChannelsNotMultipleOfFour(nchannels));
    }
    let needed = nchannels
        .checked_mul(nsubbands)
        .and_then(|n| n.checked_mul(STOKES))
        .ok_or(TransposeError::ShapeOverflow {
            nchannels,
            nsubbands,
        })?;
    if input.len() < needed {
        return Err(TransposeError::InputTooShort {
            needed,
            got: input.len(),
        });
    }
    if output.len() < needed {
        return Err(TransposeError::OutputTooShort {
            needed,
            got: output.len(),
        });
    }

    let kernel = select_kernel(path, input, output);
    // SAFETY: SSE is part of the x86_64 baseline, lengths were checked above, and each
    // kernel's alignment assumptions match the pointer checks in select_kernel.
    match kernel {
        #[cfg(target_arch = "x86_64")]
        Kernel::BothAligned => unsafe { sse::<true, true>(input, output, nchannels, nsubbands) },
        #[cfg(target_arch = "x86_64")]
        Kernel::InputAligned => unsafe { sse::<true, false>(input, output, nchannels, nsubbands) },
        #[cfg(target_arch = "x86_64")]
        Kernel::OutputAligned => unsafe { sse::<false, true>(input, output, nchannels, nsubbands) },
        #[cfg(target_arch = "x86_64")]
        Kernel::Unaligned => unsafe { sse::<false, false>(input, output, nchannels, nsubbands) },
        _ => portable(input, output, nchannels, nsubbands),
    }
    Ok(kernel)
}

fn portable(input: &[f32], output: &mut [f32], nchannels: usize, nsubbands: usize) {
    for channel in 0..nchannels {
        for subband in 0..nsubbands {
            let src = (channel * nsubbands + subband) * STOKES;
            for stokes in 0..STOKES {
                output[(subband * STOKES + stokes) * nchannels + channel] = input[src + stokes];
            }
        }
    }
}

/// # Safety
/// `input` and `output` hold at least `nchannels * nsubbands * 4` values,
/// `nchannels % 4 == 0`, and each `*_ALIGNED` flag is only set when that base
/// pointer is 16-byte aligned.
#[cfg(target_arch = "x86_64")]
unsafe fn sse<const IN_ALIGNED: bool, const OUT_ALIGNED: bool>(
    input: &[f32],
    output: &mut [f32],
    nchannels: usize,
    nsubbands: usize,
) {
    let src = input.as_ptr();
    let dst = output.as_mut_ptr();
    let src_row = nsubbands * STOKES;

    #[inline(always)]
    unsafe fn load<const ALIGNED: bool>(p: *const f32) -> __m128 {
        if ALIGNED {
            _mm_load_ps(p)
        } else {
            _mm_loadu_ps(p)
        }
    }

    #[inline(always)]
    unsafe fn store<const ALIGNED: bool>(p: *mut f32, v: __m128) {
        if ALIGNED {
            _mm_store_ps(p, v)
        } else {
            _mm_storeu_ps(p, v)
        }
    }

    for subband in 0..nsubbands {
        let out_base = dst.add(subband * STOKES * nchannels);
        let mut channel = 0;
        while channel < nchannels {
            let tile = src.add(channel * src_row + subband * STOKES);
            let r0 = load::<IN_ALIGNED>(tile);
            let r1 = load::<IN_ALIGNED>(tile.add(src_row));
            let r2 = load::<IN_ALIGNED>(tile.add(2 * src_row));
            let r3 = load::<IN_ALIGNED>(tile.add(3 * src_row));

            let t0 = _mm_unpacklo_ps(r0, r1);
            let t1 = _mm_unpacklo_ps(r2, r3);
            let t2 = _mm_unpackhi_ps(r0, r1);
            let t3 = _mm_unpackhi_ps(r2, r3);

            let out = out_base.add(channel);
            store::<OUT_ALIGNED>(out, _mm_movelh_ps(t0, t1));
            store::<OUT_ALIGNED>(out.add(nchannels), _mm_movehl_ps(t1, t0));
            store::<OUT_ALIGNED>(out.add(2 * nchannels), _mm_movelh_ps(t2, t3));
            store::<OUT_ALIGNED>(out.add(3 * nchannels), _mm_movehl_ps(t3, t2));

            channel += 4;
        }
    }
}
