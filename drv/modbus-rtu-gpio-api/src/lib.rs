// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for a single drive-enable GPIO pin, as consumed by
//! `drv-modbus-rtu` to turn an RS-485 transceiver around. A thin wrapper
//! over whatever board-specific GPIO server owns the pin; see
//! `drv-stm32h7-gpio-api` for the general-purpose version this is modeled
//! on.

#![no_std]

use core::cell::Cell;
use zerocopy::AsBytes;

use userlib::*;

enum Op {
    SetHigh = 1,
    SetLow = 2,
}

#[derive(Clone, Debug)]
pub struct DriveEnablePin(Cell<TaskId>);

impl From<TaskId> for DriveEnablePin {
    fn from(t: TaskId) -> Self {
        Self(Cell::new(t))
    }
}

#[derive(Copy, Clone, Debug)]
pub enum GpioError {
    BadPin = 1,
}

impl From<u32> for GpioError {
    fn from(x: u32) -> Self {
        match x {
            1 => GpioError::BadPin,
            _ => panic!(),
        }
    }
}

impl DriveEnablePin {
    pub fn set_high(&self) -> Result<(), GpioError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct SetHigh;

        impl hl::Call for SetHigh {
            const OP: u16 = Op::SetHigh as u16;
            type Response = ();
            type Err = GpioError;
        }

        hl::send_with_retry(&self.0, &SetHigh)
    }

    pub fn set_low(&self) -> Result<(), GpioError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct SetLow;

        impl hl::Call for SetLow {
            const OP: u16 = Op::SetLow as u16;
            type Response = ();
            type Err = GpioError;
        }

        hl::send_with_retry(&self.0, &SetLow)
    }
}
