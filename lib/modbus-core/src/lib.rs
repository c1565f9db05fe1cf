// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport-agnostic Modbus RTU core: the register image, the per-function
//! handlers, the telegram queue, and the `Handler` state machine that drives
//! both the Slave and Master roles over a half-duplex serial line.
//!
//! Bare `no_std` on target; host test builds pull in `std` so the test
//! modules can use `Box`/`vec!` to build register images.
#![cfg_attr(not(test), no_std)]

pub mod functions;
pub mod handler;
pub mod register;
pub mod telegram;
pub mod transport;

pub use handler::{Handler, HandlerConfig, ModbusTimer, Role, WorkerEvent};
pub use register::RegisterImage;
pub use telegram::{Telegram, TelegramQueue};
pub use transport::{DriveEnable, NullDriveEnable, UartTransport};
