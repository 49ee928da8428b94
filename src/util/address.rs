use bytemuck::NoUninit;

use std::fmt;
use std::ops::*;

/// size in bytes
pub type ByteSize = usize;
/// offset in bytes
pub type ByteOffset = isize;

/// Address represents an arbitrary heap address. This is designed to let us
/// do address arithmetic mostly in a safe way, marking the genuinely unsafe
/// operations (raw loads and stores) as such. The type is zero overhead,
/// memory wise and time wise.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address + ByteOffset (positive or negative)
impl Add<ByteOffset> for Address {
    type Output = Address;
    fn add(self, offset: ByteOffset) -> Address {
        Address((self.0 as isize + offset) as usize)
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address & mask
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, other: usize) -> usize {
        self.0 & other
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// The lowest possible address.
    pub const ZERO: Self = Address(0);

    /// creates Address from a usize
    pub const fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// creates Address from a pointer
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    /// the numerical value of the address
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// is this address zero?
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// aligns down the address to the given alignment (a power of two)
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// aligns up the address to the given alignment (a power of two)
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// is this address aligned to the given alignment?
    pub const fn is_aligned_to(self, align: ByteSize) -> bool {
        self.0 % align == 0
    }

    /// converts the Address to a raw pointer
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// converts the Address to a mutable raw pointer
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// loads a value of type T from the address
    ///
    /// # Safety
    /// The address must be valid, mapped and suitably aligned for T.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// stores a value of type T to the address
    ///
    /// # Safety
    /// The address must be valid, mapped and suitably aligned for T.
    pub unsafe fn store<T>(self, value: T) {
        *(self.0 as *mut T) = value;
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// ObjectReference represents a reference to a heap object. In this crate an
/// object reference is simply the address of the object's header word; the
/// distinct type marks the places that hold a known object rather than an
/// arbitrary address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit)]
pub struct ObjectReference(Address);

impl ObjectReference {
    /// The null object reference.
    pub const NULL: Self = ObjectReference(Address::ZERO);

    /// converts an address to an object reference
    pub const fn from_address(addr: Address) -> ObjectReference {
        ObjectReference(addr)
    }

    /// the start address of the object
    pub const fn to_address(self) -> Address {
        self.0
    }

    /// is this a null reference?
    pub const fn is_null(self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up() {
        let addr = Address::from_usize(0x1001);
        assert_eq!(addr.align_up(0x1000), Address::from_usize(0x2000));
        assert_eq!(addr.align_down(0x1000), Address::from_usize(0x1000));
    }

    #[test]
    fn is_aligned() {
        assert!(Address::from_usize(0x2000).is_aligned_to(0x1000));
        assert!(!Address::from_usize(0x2008).is_aligned_to(0x1000));
    }

    #[test]
    fn arithmetic() {
        let a = Address::from_usize(0x1000);
        let b = a + 0x200usize;
        assert_eq!(b - a, 0x200);
        assert_eq!(b >> 9usize, 0x9);
    }

    #[test]
    fn object_reference_null() {
        assert!(ObjectReference::NULL.is_null());
        let o = ObjectReference::from_address(Address::from_usize(0x1000));
        assert!(!o.is_null());
        assert_eq!(o.to_address(), Address::from_usize(0x1000));
    }
}
