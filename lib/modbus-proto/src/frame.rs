// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PDU layout constants and the function-code whitelist.

/// Offsets into the work buffer, shared by request and reply frames.
pub mod offset {
    pub const ID: usize = 0;
    pub const FUNC: usize = 1;
    pub const ADD_HI: usize = 2;
    pub const ADD_LO: usize = 3;
    pub const NB_HI: usize = 4;
    pub const NB_LO: usize = 5;
    pub const BYTE_CNT: usize = 6;
}

/// The largest on-the-wire frame this implementation will build or accept,
/// including station id and CRC.
pub const MAX_FRAME: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
}

impl FunctionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::ReadCoils,
            2 => Self::ReadDiscreteInputs,
            3 => Self::ReadHoldingRegisters,
            4 => Self::ReadInputRegisters,
            5 => Self::WriteSingleCoil,
            6 => Self::WriteSingleRegister,
            15 => Self::WriteMultipleCoils,
            16 => Self::WriteMultipleRegisters,
            _ => return None,
        })
    }

    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::ReadDiscreteInputs | Self::WriteMultipleCoils
        )
    }
}

/// Exception codes, as returned on the wire in byte 2 of an exception reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// Builds the 5-byte exception reply `{id, func|0x80, code, crcH, crcL}` into
/// `buf`, returning its length.
pub fn build_exception(
    buf: &mut [u8],
    id: u8,
    func: u8,
    code: ExceptionCode,
) -> usize {
    buf[offset::ID] = id;
    buf[offset::FUNC] = func | 0x80;
    buf[2] = code as u8;
    crate::crc::append(buf, 3)
}

pub fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub fn write_u16(buf: &mut [u8], at: usize, v: u16) {
    let b = v.to_be_bytes();
    buf[at] = b[0];
    buf[at + 1] = b[1];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_reply_shape() {
        let mut buf = [0u8; MAX_FRAME];
        let len = build_exception(&mut buf, 0x11, 0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(len, 5);
        assert_eq!(buf[0], 0x11);
        assert_eq!(buf[1], 0x83);
        assert_eq!(buf[2], 0x02);
    }

    #[test]
    fn function_code_whitelist() {
        assert!(FunctionCode::from_u8(7).is_none());
        assert_eq!(FunctionCode::from_u8(16), Some(FunctionCode::WriteMultipleRegisters));
    }
}
