// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application-facing client API for `drv-modbus-rtu`.
//!
//! `query`/`query_inject` enqueue a Master telegram and then block until
//! the worker task replies with the outcome — the Hubris-idiomatic
//! equivalent of spec.md's "direct task notification on the caller's task"
//! (see DESIGN.md): a deferred IPC reply, the same mechanism
//! `drv-stm32h7-usart` uses to complete an async transmit.
//!
//! The register accessors exist because a Slave's register image lives
//! inside the worker task rather than in shared memory (see
//! SPEC_FULL.md section 5.1); they're modeled on `drv-stm32h7-gpio-api`'s
//! `read_input`/`set_reset` accessor pattern.

#![no_std]

use core::cell::Cell;
use userlib::*;
use zerocopy::AsBytes;

pub use modbus_proto::ModbusError;

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
enum Operation {
    Start = 1,
    Query = 2,
    QueryInject = 3,
    ReadCoil = 4,
    WriteCoil = 5,
    ReadDiscrete = 6,
    ReadHolding = 7,
    WriteHolding = 8,
    ReadInput = 9,
}

#[derive(Clone, Debug)]
pub struct ModbusRtu(Cell<TaskId>);

impl From<TaskId> for ModbusRtu {
    fn from(t: TaskId) -> Self {
        Self(Cell::new(t))
    }
}

#[derive(Copy, Clone, Debug, AsBytes)]
#[repr(C)]
struct QueryRequest {
    station: u8,
    function: u8,
    _pad: u16,
    address: u16,
    quantity: u16,
}

impl ModbusRtu {
    pub fn start(&self) -> Result<(), ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct Start;

        impl hl::Call for Start {
            const OP: u16 = Operation::Start as u16;
            type Response = ();
            type Err = ModbusError;
        }

        hl::send_with_retry(&self.0, &Start)
    }

    /// Enqueues a read or write of `quantity` coils/registers starting at
    /// `address` against station `station`. `words` is both the source (for
    /// write function codes) and destination (for read function codes) of
    /// the transferred data, mirroring the telegram's dual-purpose word
    /// array (spec.md section 3). Blocks until the worker has sent the
    /// query and received (or timed out waiting for) the reply.
    pub fn query(&self, station: u8, function: u8, address: u16, quantity: u16, words: &mut [u16]) -> Result<(), ModbusError> {
        self.send_query(Operation::Query, station, function, address, quantity, words)
    }

    /// As `query`, but clears any currently-queued telegrams first.
    pub fn query_inject(&self, station: u8, function: u8, address: u16, quantity: u16, words: &mut [u16]) -> Result<(), ModbusError> {
        self.send_query(Operation::QueryInject, station, function, address, quantity, words)
    }

    fn send_query(&self, op: Operation, station: u8, function: u8, address: u16, quantity: u16, words: &mut [u16]) -> Result<(), ModbusError> {
        let task = self.0.get();
        let req = QueryRequest {
            station,
            function,
            _pad: 0,
            address,
            quantity,
        };
        let mut byte_buf = [0u8; 2 * 125];
        let n = words.len().min(125);
        for (i, w) in words.iter().enumerate().take(n) {
            let b = w.to_be_bytes();
            byte_buf[2 * i] = b[0];
            byte_buf[2 * i + 1] = b[1];
        }
        let (rc, _) = sys_send(
            task,
            op as u16,
            req.as_bytes(),
            &mut [],
            &[Lease::from(&mut byte_buf[..2 * n])],
        );
        if rc != 0 {
            return Err(ModbusError::from(rc));
        }
        for (i, w) in words.iter_mut().enumerate().take(n) {
            *w = u16::from_be_bytes([byte_buf[2 * i], byte_buf[2 * i + 1]]);
        }
        Ok(())
    }

    pub fn read_coil(&self, address: u16) -> Result<bool, ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct ReadCoil {
            address: u16,
        }

        impl hl::Call for ReadCoil {
            const OP: u16 = Operation::ReadCoil as u16;
            type Response = u8;
            type Err = ModbusError;
        }

        Ok(hl::send_with_retry(&self.0, &ReadCoil { address })? != 0)
    }

    pub fn write_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct WriteCoil {
            address: u16,
            value: u8,
            _pad: u8,
        }

        impl hl::Call for WriteCoil {
            const OP: u16 = Operation::WriteCoil as u16;
            type Response = ();
            type Err = ModbusError;
        }

        hl::send_with_retry(
            &self.0,
            &WriteCoil {
                address,
                value: value as u8,
                _pad: 0,
            },
        )
    }

    pub fn read_discrete(&self, address: u16) -> Result<bool, ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct ReadDiscrete {
            address: u16,
        }

        impl hl::Call for ReadDiscrete {
            const OP: u16 = Operation::ReadDiscrete as u16;
            type Response = u8;
            type Err = ModbusError;
        }

        Ok(hl::send_with_retry(&self.0, &ReadDiscrete { address })? != 0)
    }

    pub fn read_holding(&self, address: u16) -> Result<u16, ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct ReadHolding {
            address: u16,
        }

        impl hl::Call for ReadHolding {
            const OP: u16 = Operation::ReadHolding as u16;
            type Response = u16;
            type Err = ModbusError;
        }

        hl::send_with_retry(&self.0, &ReadHolding { address })
    }

    pub fn write_holding(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct WriteHolding {
            address: u16,
            value: u16,
        }

        impl hl::Call for WriteHolding {
            const OP: u16 = Operation::WriteHolding as u16;
            type Response = ();
            type Err = ModbusError;
        }

        hl::send_with_retry(&self.0, &WriteHolding { address, value })
    }

    pub fn read_input(&self, address: u16) -> Result<u16, ModbusError> {
        #[derive(AsBytes)]
        #[repr(C)]
        struct ReadInput {
            address: u16,
        }

        impl hl::Call for ReadInput {
            const OP: u16 = Operation::ReadInput as u16;
            type Response = u16;
            type Err = ModbusError;
        }

        hl::send_with_retry(&self.0, &ReadInput { address })
    }
}
