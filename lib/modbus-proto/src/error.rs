// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local/transport error codes, carried in `last_error` and in the
//! notification delivered to a Master caller's task.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ModbusError {
    /// Success; only ever produced for a Master query.
    OkQuery = 0,
    NotMaster = 1,
    Polling = 2,
    BadSlaveId = 3,
    BadSize = 4,
    BadCrc = 5,
    Exception = 6,
    TimeOut = 7,
    BuffOverflow = 8,
    TxStall = 9,
    QueueFull = 10,
    IllegalFunction = 11,
}

impl From<u32> for ModbusError {
    fn from(x: u32) -> Self {
        match x {
            0 => Self::OkQuery,
            1 => Self::NotMaster,
            2 => Self::Polling,
            3 => Self::BadSlaveId,
            4 => Self::BadSize,
            5 => Self::BadCrc,
            6 => Self::Exception,
            7 => Self::TimeOut,
            8 => Self::BuffOverflow,
            9 => Self::TxStall,
            10 => Self::QueueFull,
            11 => Self::IllegalFunction,
            _ => panic!(),
        }
    }
}

impl From<ModbusError> for u32 {
    fn from(e: ModbusError) -> Self {
        e as u32
    }
}
