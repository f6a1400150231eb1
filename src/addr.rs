//! Virtual and physical address newtypes.
//!
//! Unlike the kernel this crate was grounded on, there is no global
//! HHDM-style offset here: converting between a [`VirtAddr`] and its
//! [`PhysAddr`] (or back) only ever happens through
//! [`crate::platform::Platform::virt_to_phys`], and the result is cached by
//! whoever asked (see [`crate::dma::Dma`]) rather than re-derived later.

use core::fmt::{Debug, LowerHex};
use core::ops::{Add, AddAssign, Deref, DerefMut, Sub, SubAssign};

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VirtAddr({self:#x})")
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PhysAddr({self:#x})")
    }
}

macro_rules! impl_addr_ty {
    ($ty: ty) => {
        impl $ty {
            #[inline(always)]
            pub const fn null() -> Self {
                Self(0)
            }

            #[inline(always)]
            pub const fn from(value: usize) -> Self {
                Self(value)
            }

            #[inline(always)]
            pub const fn into_bits(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn into_raw(self) -> usize {
                self.0
            }

            #[inline(always)]
            pub const fn from_bits(bits: usize) -> Self {
                Self(bits)
            }

            #[inline(always)]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl LowerHex for $ty {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                LowerHex::fmt(&self.0, f)
            }
        }

        impl From<usize> for $ty {
            #[inline(always)]
            fn from(value: usize) -> Self {
                Self::from(value)
            }
        }

        impl Add<usize> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Add<$ty> for $ty {
            type Output = $ty;
            #[inline(always)]
            fn add(self, rhs: $ty) -> Self::Output {
                self + rhs.0
            }
        }

        impl AddAssign<usize> for $ty {
            #[inline(always)]
            fn add_assign(&mut self, rhs: usize) {
                *self = *self + rhs
            }
        }

        impl Sub<$ty> for $ty {
            type Output = usize;
            #[inline(always)]
            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl Sub<usize> for $ty {
            type Output = Self;
            #[inline(always)]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl SubAssign<usize> for $ty {
            #[inline(always)]
            fn sub_assign(&mut self, rhs: usize) {
                *self = *self - rhs
            }
        }

        impl Deref for $ty {
            type Target = usize;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl DerefMut for $ty {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        impl AlignTo<usize> for $ty {
            #[inline(always)]
            fn to_next_multiple_of(self, alignment: usize) -> Self {
                Self::from(self.into_raw().next_multiple_of(alignment))
            }
            #[inline(always)]
            fn to_previous_multiple_of(self, alignment: usize) -> Self {
                Self::from((self.into_raw() / alignment) * alignment)
            }
        }

        impl AlignTo<$ty> for $ty {
            #[inline(always)]
            fn to_next_multiple_of(self, alignment: Self) -> Self {
                AlignTo::<usize>::to_next_multiple_of(self, alignment.into_raw())
            }
            #[inline(always)]
            fn to_previous_multiple_of(self, alignment: Self) -> Self {
                AlignTo::<usize>::to_previous_multiple_of(self, alignment.into_raw())
            }
        }
    };
}

impl_addr_ty!(VirtAddr);
impl_addr_ty!(PhysAddr);

impl VirtAddr {
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(value: *const T) -> Self {
        Self(value.addr())
    }

    #[inline(always)]
    pub const fn into_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl<T> From<*const T> for VirtAddr {
    #[inline(always)]
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for VirtAddr {
    #[inline(always)]
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value)
    }
}

/// Address-alignment helpers, lifted off the raw `usize` so callers can
/// align a [`VirtAddr`]/[`PhysAddr`] without unwrapping it first.
pub trait AlignTo<Other>: Sized {
    /// Rounds `self` up to the next multiple of `alignment`.
    fn to_next_multiple_of(self, alignment: Other) -> Self;
    /// Rounds `self` down to the previous multiple of `alignment`.
    fn to_previous_multiple_of(self, alignment: Other) -> Self;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_roundtrips() {
        let a = PhysAddr::from(0x1000);
        let b = a + 0x20usize;
        assert_eq!(b.into_raw(), 0x1020);
        assert_eq!(b - a, 0x20);
    }

    #[test]
    fn alignment() {
        let a = VirtAddr::from(0x1001);
        assert_eq!(a.to_next_multiple_of(0x1000usize).into_raw(), 0x2000);
        assert_eq!(a.to_previous_multiple_of(0x1000usize).into_raw(), 0x1000);
    }

    #[test]
    fn null_is_zero() {
        assert!(PhysAddr::null().is_null());
        assert!(!PhysAddr::from(1).is_null());
    }
}
