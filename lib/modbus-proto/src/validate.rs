// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Length/CRC/function-code checks shared by the Slave and Master validators.
//! Address-range checks need the register image's sizes and live in
//! `modbus-core` instead.

use crate::crc;
use crate::error::ModbusError;
use crate::frame::{offset, FunctionCode};

/// Slave-side basic validation: length >= 7, CRC ok. The function-code
/// whitelist failure is reported to the caller as an exception, not an
/// error, so it isn't folded into this check (see `modbus-core`'s slave
/// dispatch, which re-reads `buf[offset::FUNC]` itself).
pub fn check_basic_slave(buf: &[u8]) -> Result<(), ModbusError> {
    if buf.len() < 7 {
        return Err(ModbusError::BadSize);
    }
    if !crc::check(buf) {
        return Err(ModbusError::BadCrc);
    }
    Ok(())
}

/// Master-side reply validation per spec.md 4.5, steps 1-4. On success,
/// returns the decoded function code; an exception reply is reported via
/// `ModbusError::Exception` (the exception code itself is at byte 2).
pub fn check_reply_master(buf: &[u8]) -> Result<FunctionCode, ModbusError> {
    if buf.len() < 6 {
        return Err(ModbusError::BadSize);
    }
    if !crc::check(buf) {
        return Err(ModbusError::BadCrc);
    }
    if buf[offset::FUNC] & 0x80 != 0 {
        return Err(ModbusError::Exception);
    }
    FunctionCode::from_u8(buf[offset::FUNC]).ok_or(ModbusError::IllegalFunction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::append;

    fn request(func: u8) -> ([u8; 16], usize) {
        let mut buf = [0u8; 16];
        buf[offset::ID] = 1;
        buf[offset::FUNC] = func;
        buf[offset::ADD_HI] = 0;
        buf[offset::ADD_LO] = 0;
        buf[offset::NB_HI] = 0;
        buf[offset::NB_LO] = 10;
        let len = append(&mut buf, 6);
        (buf, len)
    }

    #[test]
    fn short_request_is_bad_size() {
        let buf = [0x01, 0x03, 0x00, 0x00, 0x00];
        assert_eq!(check_basic_slave(&buf), Err(ModbusError::BadSize));
    }

    #[test]
    fn valid_request_passes() {
        let (buf, len) = request(3);
        assert_eq!(check_basic_slave(&buf[..len]), Ok(()));
    }

    #[test]
    fn bad_crc_is_rejected() {
        let (mut buf, len) = request(3);
        buf[len - 1] ^= 0xFF;
        assert_eq!(check_basic_slave(&buf[..len]), Err(ModbusError::BadCrc));
    }

    #[test]
    fn exception_bit_detected_on_master_side() {
        let mut buf = [0u8; 8];
        buf[offset::ID] = 1;
        buf[offset::FUNC] = 0x83;
        buf[2] = 0x02;
        let len = append(&mut buf, 3);
        assert_eq!(
            check_reply_master(&buf[..len]),
            Err(ModbusError::Exception)
        );
    }
}
