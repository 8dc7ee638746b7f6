use core::ops::{Deref, DerefMut};

/// Size of each buffer lent to the filesystem consumer.
pub const BUFFER_SIZE: usize = 256;

/// A byte array which is always 4-byte aligned.
#[repr(C, align(4))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlignedBuffer<const N: usize>([u8; N]);

const _: () = assert!(core::mem::align_of::<AlignedBuffer<1>>() >= 4);

impl<const N: usize> AlignedBuffer<N> {
    pub const fn new() -> Self {
        AlignedBuffer([0u8; N])
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<const N: usize> Default for AlignedBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Deref for AlignedBuffer<N> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> DerefMut for AlignedBuffer<N> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Working memory owned by one instance and lent to the consumer per call.
#[derive(Clone, Debug, Default)]
pub struct Buffers {
    pub read: AlignedBuffer<BUFFER_SIZE>,
    pub prog: AlignedBuffer<BUFFER_SIZE>,
    pub lookahead: AlignedBuffer<BUFFER_SIZE>,
}
