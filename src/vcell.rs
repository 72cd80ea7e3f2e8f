//! Volatile cell that conforms to the RAL's register API
//!
//! Every no2usb register and every word of packet memory is accessed
//! through one of these, so the compiler never merges or elides a load
//! that the hardware might have changed underneath us.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    #[inline(always)]
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}
