// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level pieces of the Modbus RTU protocol: CRC-16, frame layout, the
//! function-code whitelist, and the length/CRC/exception-bit checks shared
//! by the Slave and Master validators.
#![no_std]

pub mod crc;
pub mod error;
pub mod frame;
pub mod validate;

pub use error::ModbusError;
pub use frame::{ExceptionCode, FunctionCode};
