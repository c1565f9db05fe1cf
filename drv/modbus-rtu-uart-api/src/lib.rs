// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the half-duplex UART driver `drv-modbus-rtu` runs on top
//! of (out of scope per spec.md section 1; this crate only states the
//! contract). Modeled on `drv-gimlet-hf-api`'s raw-lease send for the
//! variable-length transmit buffer, and `drv-user-leds-api`'s `hl::Call`
//! pattern for the fixed, no-payload operations.

#![no_std]

use core::cell::Cell;
use userlib::*;
use zerocopy::{AsBytes, FromBytes};

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
enum Operation {
    BeginTransmit = 1,
    TransmitComplete = 2,
    SetReceiveMode = 3,
    SetTransmitMode = 4,
    TakeRxByte = 5,
}

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RxByteResponse {
    pub has_byte: u8,
    pub byte: u8,
}

#[derive(Copy, Clone, Debug)]
pub enum UartError {
    Busy = 1,
}

impl From<u32> for UartError {
    fn from(x: u32) -> Self {
        match x {
            1 => UartError::Busy,
            _ => panic!(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModbusUart(Cell<TaskId>);

impl From<TaskId> for ModbusUart {
    fn from(t: TaskId) -> Self {
        Self(Cell::new(t))
    }
}

impl ModbusUart {
    /// Starts (or restarts) a non-blocking transmit of `buf`. The driver
    /// owns the buffer for the duration of the transmit; the caller must
    /// not reuse it until `transmit_complete` reports done.
    pub fn begin_transmit(&self, buf: &[u8]) -> Result<(), UartError> {
        let task = self.0.get();
        let (rc, _) = sys_send(
            task,
            Operation::BeginTransmit as u16,
            &[],
            &mut [],
            &[Lease::from(buf)],
        );
        if rc == 0 {
            Ok(())
        } else {
            Err(UartError::from(rc))
        }
    }

    /// Polls the UART's transmit-complete status bit (the last bit of the
    /// last byte is actually on the wire, not just clocked into the shift
    /// register).
    pub fn transmit_complete(&self) -> bool {
        #[derive(AsBytes)]
        #[repr(C)]
        struct Poll;

        impl hl::Call for Poll {
            const OP: u16 = Operation::TransmitComplete as u16;
            type Response = u8;
            type Err = UartError;
        }

        hl::send_with_retry(&self.0, &Poll).unwrap_or(0) != 0
    }

    pub fn set_receive_mode(&self) {
        #[derive(AsBytes)]
        #[repr(C)]
        struct SetReceiveMode;

        impl hl::Call for SetReceiveMode {
            const OP: u16 = Operation::SetReceiveMode as u16;
            type Response = ();
            type Err = UartError;
        }

        let _ = hl::send_with_retry(&self.0, &SetReceiveMode);
    }

    pub fn set_transmit_mode(&self) {
        #[derive(AsBytes)]
        #[repr(C)]
        struct SetTransmitMode;

        impl hl::Call for SetTransmitMode {
            const OP: u16 = Operation::SetTransmitMode as u16;
            type Response = ();
            type Err = UartError;
        }

        let _ = hl::send_with_retry(&self.0, &SetTransmitMode);
    }

    /// Pulls one buffered received byte, if any. The driver posts a direct
    /// notification to the consuming task whenever it has bytes ready
    /// (`RX_READY_NOTIFICATION_BIT` below); the consumer drains with
    /// repeated calls to this until it returns `None`.
    pub fn take_rx_byte(&self) -> Option<u8> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct TakeRxByte;

        impl hl::Call for TakeRxByte {
            const OP: u16 = Operation::TakeRxByte as u16;
            type Response = RxByteResponse;
            type Err = UartError;
        }

        let resp = hl::send_with_retry(&self.0, &TakeRxByte).ok()?;
        if resp.has_byte != 0 {
            Some(resp.byte)
        } else {
            None
        }
    }
}

/// The notification bit the UART driver posts (via `sys_post`) to tell its
/// consumer that `take_rx_byte` has data. Out of scope to implement here,
/// but fixed so both sides agree.
pub const RX_READY_NOTIFICATION_BIT: u8 = 0;
