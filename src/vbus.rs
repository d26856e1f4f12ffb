//! External VBUS power switch control
//!
//! Boards gate 5 V VBUS through an external high-side switch with an
//! active-low enable pin. [`VbusSwitch`] wraps that pin; pair it with
//! [`UsbHost::port_power`](crate::host::UsbHost::port_power) so the
//! controller's port power state and the physical rail agree.

use embedded_hal::digital::OutputPin;

/// Active-low VBUS power switch enable pin
pub struct VbusSwitch<P> {
    pin: P,
}

impl<P: OutputPin> VbusSwitch<P> {
    /// Wrap the switch enable pin; the rail starts off
    pub fn new(mut pin: P) -> Result<Self, P::Error> {
        pin.set_high()?;
        Ok(Self { pin })
    }

    /// Enable 5 V to the port
    pub fn power_on(&mut self) -> Result<(), P::Error> {
        self.pin.set_low()
    }

    /// Cut 5 V to the port
    pub fn power_off(&mut self) -> Result<(), P::Error> {
        self.pin.set_high()
    }

    /// Release the pin
    pub fn release(self) -> P {
        self.pin
    }
}
