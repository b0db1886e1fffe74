//! Endian-safe fixed-width integers for wire headers
//!
//! A `WireInt<T, O>` keeps its value in memory exactly as it travels on the
//! wire, so a header made of them can be copied to and from a socket byte
//! for byte. Reading converts to host order, writing converts back.
//!
//! The wire order is a type parameter. `DefaultOrder` is little-endian unless
//! the `big-endian-wire` feature is enabled.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Byte order used on the wire
pub trait WireOrder: Copy + Default + Send + Sync + 'static {
    /// `true` when the wire carries the most significant byte first
    const BIG_ENDIAN: bool;
}

/// Most significant byte first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BigEndian;

/// Least significant byte first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LittleEndian;

impl WireOrder for BigEndian {
    const BIG_ENDIAN: bool = true;
}

impl WireOrder for LittleEndian {
    const BIG_ENDIAN: bool = false;
}

#[cfg(feature = "big-endian-wire")]
pub type DefaultOrder = BigEndian;

#[cfg(not(feature = "big-endian-wire"))]
pub type DefaultOrder = LittleEndian;

/// `true` when host and wire disagree and every access must swap bytes
#[inline(always)]
pub const fn needs_swap<O: WireOrder>() -> bool {
    cfg!(target_endian = "big") != O::BIG_ENDIAN
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive integers that can live in a wire header
pub trait WireRepr: sealed::Sealed + Copy + Default + Eq + Hash + fmt::Debug + Send + Sync {
    /// Width in bytes
    const WIDTH: usize;

    fn swap(self) -> Self;

    /// Copy the in-memory bytes into `out[..WIDTH]`
    fn write_ne(self, out: &mut [u8]);

    /// Reinterpret `bytes[..WIDTH]` as in-memory bytes
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_repr {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl WireRepr for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            #[inline(always)]
            fn swap(self) -> Self {
                self.swap_bytes()
            }

            #[inline(always)]
            fn write_ne(self, out: &mut [u8]) {
                out[..Self::WIDTH].copy_from_slice(&self.to_ne_bytes());
            }

            #[inline(always)]
            fn read_ne(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..Self::WIDTH]);
                <$t>::from_ne_bytes(raw)
            }
        }
    )*};
}

impl_wire_repr!(i8, u8, i16, u16, i32, u32, i64, u64);

/// Integer stored in wire byte order
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct WireInt<T: WireRepr, O: WireOrder = DefaultOrder> {
    raw: T,
    _order: PhantomData<O>,
}

impl<T: WireRepr, O: WireOrder> WireInt<T, O> {
    #[inline(always)]
    fn transform(value: T) -> T {
        if needs_swap::<O>() {
            value.swap()
        } else {
            value
        }
    }

    /// Wrap a host-order value
    #[inline(always)]
    pub fn from_host(value: T) -> Self {
        Self {
            raw: Self::transform(value),
            _order: PhantomData,
        }
    }

    /// Host-order value
    #[inline(always)]
    pub fn to_host(self) -> T {
        Self::transform(self.raw)
    }

    /// Overwrite with a host-order value
    #[inline(always)]
    pub fn set(&mut self, value: T) {
        self.raw = Self::transform(value);
    }

    /// Raw in-memory value, already in wire order
    #[inline(always)]
    pub fn raw(self) -> T {
        self.raw
    }

    /// Build from bytes exactly as received from the wire
    ///
    /// # Panics
    /// Panics if `bytes` is shorter than the integer width.
    #[inline(always)]
    pub fn from_wire_bytes(bytes: &[u8]) -> Self {
        Self {
            raw: T::read_ne(bytes),
            _order: PhantomData,
        }
    }

    /// Write the wire representation into `out[..width]`
    ///
    /// # Panics
    /// Panics if `out` is shorter than the integer width.
    #[inline(always)]
    pub fn write_wire_bytes(self, out: &mut [u8]) {
        self.raw.write_ne(out);
    }

    /// Wire representation as an owned vector
    pub fn to_wire_bytes(self) -> Vec<u8> {
        let mut out = vec![0u8; T::WIDTH];
        self.write_wire_bytes(&mut out);
        out
    }
}

impl<T: WireRepr, O: WireOrder> Default for WireInt<T, O> {
    fn default() -> Self {
        Self {
            raw: T::default(),
            _order: PhantomData,
        }
    }
}

impl<T: WireRepr, O: WireOrder> From<T> for WireInt<T, O> {
    #[inline(always)]
    fn from(value: T) -> Self {
        Self::from_host(value)
    }
}

impl<T: WireRepr, O: WireOrder> PartialEq for WireInt<T, O> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: WireRepr, O: WireOrder> Eq for WireInt<T, O> {}

impl<T: WireRepr, O: WireOrder> Hash for WireInt<T, O> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: WireRepr, O: WireOrder> fmt::Debug for WireInt<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_host(), f)
    }
}

pub type NInt8 = WireInt<i8>;
pub type NUInt8 = WireInt<u8>;
pub type NInt16 = WireInt<i16>;
pub type NUInt16 = WireInt<u16>;
pub type NInt32 = WireInt<i32>;
pub type NUInt32 = WireInt<u32>;
pub type NInt64 = WireInt<i64>;
pub type NUInt64 = WireInt<u64>;
