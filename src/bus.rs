//! Interrupt-safe access to the device stack

use crate::{
    function::{DriverId, FunctionDriver},
    stack::{DeviceState, Stack},
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::UsbError;

/// Shares a [`Stack`] between foreground code and the USB interrupt
///
/// Every method runs in a critical section. Call
/// [`on_interrupt()`](BusAdapter::on_interrupt) from the USB interrupt
/// handler; use the other methods from anywhere.
pub struct BusAdapter<'a, const N: usize = 4> {
    stack: Mutex<RefCell<Stack<'a, N>>>,
}

impl<'a, const N: usize> BusAdapter<'a, N> {
    /// Wrap a stack
    ///
    /// Register your function drivers and call
    /// [`initialize()`](Stack::initialize) before wrapping the stack, or
    /// do it later with [`with_stack_mut()`](BusAdapter::with_stack_mut).
    pub fn new(stack: Stack<'a, N>) -> Self {
        BusAdapter {
            stack: Mutex::new(RefCell::new(stack)),
        }
    }

    /// Interrupt-safe, immutable access to the stack
    pub fn with_stack<R>(&self, func: impl FnOnce(&Stack<'a, N>) -> R) -> R {
        interrupt::free(|cs| {
            let stack = self.stack.borrow(cs);
            let stack = stack.borrow();
            func(&stack)
        })
    }

    /// Interrupt-safe, mutable access to the stack
    pub fn with_stack_mut<R>(&self, func: impl FnOnce(&mut Stack<'a, N>) -> R) -> R {
        interrupt::free(|cs| {
            let stack = self.stack.borrow(cs);
            let mut stack = stack.borrow_mut();
            func(&mut stack)
        })
    }

    pub fn register(&self, driver: &'a mut dyn FunctionDriver) -> Result<DriverId, UsbError> {
        self.with_stack_mut(|stack| stack.register(driver))
    }

    /// Service the stack from the USB interrupt handler
    pub fn on_interrupt(&self) {
        self.with_stack_mut(|stack| stack.poll());
    }

    /// Enable or disable the USB interrupt sources
    pub fn set_interrupts(&self, interrupts: bool) {
        self.with_stack_mut(|stack| stack.driver_mut().set_interrupts(interrupts));
    }

    pub fn connect(&self) {
        self.with_stack_mut(|stack| {
            stack.connect();
            debug!("CONNECT");
        });
    }

    pub fn disconnect(&self) {
        self.with_stack_mut(|stack| {
            stack.disconnect();
            debug!("DISCONNECT");
        });
    }

    pub fn state(&self) -> DeviceState {
        self.with_stack(|stack| stack.state())
    }
}
