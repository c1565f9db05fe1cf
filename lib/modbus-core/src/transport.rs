// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract traits for the out-of-scope UART and drive-enable GPIO
//! collaborators (spec.md section 1). Neither is implemented here; the task
//! binary wires real drivers in through these traits, and host tests use
//! fakes.

/// Non-blocking half-duplex UART: kick off a transmit, poll for the
/// transmit-complete status bit, and switch line direction.
pub trait UartTransport {
    /// Starts transmitting `buf`. Framing (CRC) is already appended.
    fn begin_transmit(&mut self, buf: &[u8]);

    /// Polls the UART's transmit-complete status bit (the last shift
    /// register bit is on the wire). Called in a bounded spin loop by
    /// `Handler::send`.
    fn transmit_complete(&mut self) -> bool;

    fn set_receive_mode(&mut self);
    fn set_transmit_mode(&mut self);
}

/// The optional RS-485 transceiver drive-enable pin.
pub trait DriveEnable {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

/// For ports wired without a drive-enable pin (full-duplex RS-232, or a
/// transceiver with automatic direction sensing).
pub struct NullDriveEnable;

impl DriveEnable for NullDriveEnable {
    fn set_high(&mut self) {}
    fn set_low(&mut self) {}
}
