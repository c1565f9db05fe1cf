// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One routine per supported function code. Each runs under the
//! register-image mutex (see `Handler::dispatch_slave`), mutates the work
//! buffer in place and returns the resulting frame length including CRC.

use modbus_proto::crc;
use modbus_proto::frame::{offset, read_u16, write_u16};
use modbus_proto::ExceptionCode;

use crate::register::RegisterImage;

pub type HandlerResult = Result<usize, ExceptionCode>;
type HandlerFn = fn(&mut RegisterImage, &mut [u8]) -> HandlerResult;

const DISPATCH: &[(u8, HandlerFn)] = &[
    (1, read_coils),
    (2, read_discretes),
    (3, read_holding),
    (4, read_input),
    (5, write_single_coil),
    (6, write_single_register),
    (15, write_multiple_coils),
    (16, write_multiple_registers),
];

/// Looks up and runs the handler for `buf[offset::FUNC]`. The function-code
/// whitelist check already happened in the validator; an unrecognized code
/// here can only mean a programming error in the dispatch table itself.
pub fn dispatch(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let func = buf[offset::FUNC];
    let handler = DISPATCH
        .iter()
        .find(|&&(code, _)| code == func)
        .map(|&(_, f)| f)
        .ok_or(ExceptionCode::IllegalFunction)?;
    handler(image, buf)
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

fn read_bits(image: &mut RegisterImage, buf: &mut [u8], readable_bits: usize, is_coil: bool) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    let qty = read_u16(buf, offset::NB_HI) as usize;
    let start_word = address / 16;
    let words = ceil_div(qty.max(1), 16);
    if start_word + words > ceil_div(readable_bits, 16) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    let byte_count = ceil_div(qty, 8);
    if 3 + byte_count + 2 > 256 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    buf[2] = byte_count as u8;
    for b in &mut buf[3..3 + byte_count] {
        *b = 0;
    }
    for i in 0..qty {
        let v = if is_coil {
            image.coil(address + i)
        } else {
            image.discrete(address + i)
        };
        if v {
            buf[3 + i / 8] |= 1 << (i % 8);
        }
    }
    Ok(crc::append(buf, 3 + byte_count))
}

fn read_coils(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let size = image.sizes().coils;
    read_bits(image, buf, size, true)
}

fn read_discretes(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let size = image.sizes().discretes;
    read_bits(image, buf, size, false)
}

fn read_words(image: &mut RegisterImage, buf: &mut [u8], readable_words: usize, is_holding: bool) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    let qty = read_u16(buf, offset::NB_HI) as usize;
    if address + qty > readable_words {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    let byte_count = qty * 2;
    if 3 + byte_count + 2 > 256 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    buf[2] = byte_count as u8;
    for i in 0..qty {
        let w = if is_holding {
            image.holding(address + i)
        } else {
            image.input(address + i)
        };
        write_u16(buf, 3 + 2 * i, w);
    }
    Ok(crc::append(buf, 3 + byte_count))
}

fn read_holding(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let size = image.sizes().holding;
    read_words(image, buf, size, true)
}

fn read_input(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let size = image.sizes().input;
    read_words(image, buf, size, false)
}

fn write_single_coil(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    if address / 16 >= ceil_div(image.sizes().coils, 16) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    // Source behavior: only the high byte of the value field is consulted.
    let set = buf[offset::NB_HI] == 0xFF;
    image.set_coil(address, set);
    Ok(crc::append(buf, 6))
}

fn write_single_register(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    if address >= image.sizes().holding {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    let value = read_u16(buf, offset::NB_HI);
    image.set_holding(address, value);
    Ok(crc::append(buf, 6))
}

fn write_multiple_coils(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    let qty = read_u16(buf, offset::NB_HI) as usize;
    let start_word = address / 16;
    let words = ceil_div(qty.max(1), 16);
    if start_word + words > ceil_div(image.sizes().coils, 16) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    for i in 0..qty {
        let byte = buf[7 + i / 8];
        let v = (byte >> (i % 8)) & 1 != 0;
        image.set_coil(address + i, v);
    }
    // Echo the 6-byte request header as the reply.
    Ok(crc::append(buf, 6))
}

fn write_multiple_registers(image: &mut RegisterImage, buf: &mut [u8]) -> HandlerResult {
    let address = read_u16(buf, offset::ADD_HI) as usize;
    let qty = read_u16(buf, offset::NB_HI) as usize;
    if address + qty > image.sizes().holding {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    for i in 0..qty {
        let w = read_u16(buf, 7 + 2 * i);
        image.set_holding(address + i, w);
    }
    // Source quirk, preserved: NB_HI forced to 0, NB_LO truncated to the
    // low byte of the quantity. See the FC16 reply Open Question in
    // SPEC_FULL.md / DESIGN.md.
    buf[offset::NB_HI] = 0;
    buf[offset::NB_LO] = qty as u8;
    Ok(crc::append(buf, 6))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(coil_words: usize, holding_words: usize) -> (Box<[u16]>, Box<[u16]>, Box<[u16]>, Box<[u16]>) {
        (
            vec![0u16; coil_words].into_boxed_slice(),
            vec![0u16; coil_words].into_boxed_slice(),
            vec![0u16; holding_words].into_boxed_slice(),
            vec![0u16; holding_words].into_boxed_slice(),
        )
    }

    fn leak(b: Box<[u16]>) -> &'static mut [u16] {
        Box::leak(b)
    }

    #[test]
    fn fc3_reads_holding_registers() {
        let (c, d, mut h, i) = image(1, 16);
        for (n, w) in h.iter_mut().enumerate().take(10) {
            *w = n as u16;
        }
        let mut img = RegisterImage::new(leak(c), leak(d), leak(h), leak(i));

        let mut buf = [0u8; 64];
        buf[offset::ID] = 1;
        buf[offset::FUNC] = 3;
        write_u16(&mut buf, offset::ADD_HI, 0);
        write_u16(&mut buf, offset::NB_HI, 10);

        let len = dispatch(&mut img, &mut buf).unwrap();
        assert_eq!(buf[1], 3);
        assert_eq!(buf[2], 20);
        for n in 0..10u16 {
            assert_eq!(read_u16(&buf, 3 + 2 * n as usize), n);
        }
        assert!(modbus_proto::crc::check(&buf[..len]));
    }

    #[test]
    fn fc6_writes_single_register() {
        let (c, d, h, i) = image(1, 16);
        let mut img = RegisterImage::new(leak(c), leak(d), leak(h), leak(i));

        let mut buf = [0u8; 16];
        buf[offset::ID] = 2;
        buf[offset::FUNC] = 6;
        write_u16(&mut buf, offset::ADD_HI, 5);
        write_u16(&mut buf, offset::NB_HI, 0x1234);

        dispatch(&mut img, &mut buf).unwrap();
        assert_eq!(img.holding(5), 0x1234);
        assert_eq!(&buf[..6], &[2, 6, 0, 5, 0x12, 0x34]);
    }

    #[test]
    fn fc1_packs_bits_lsb_first() {
        let (mut c, d, h, i) = image(1, 1);
        // coils 2,3,5,8,10 set.
        for bit in [2, 3, 5, 8, 10] {
            c[bit / 16] |= 1 << (bit % 16);
        }
        let mut img = RegisterImage::new(leak(c), leak(d), leak(h), leak(i));

        let mut buf = [0u8; 16];
        buf[offset::ID] = 1;
        buf[offset::FUNC] = 1;
        write_u16(&mut buf, offset::ADD_HI, 2);
        write_u16(&mut buf, offset::NB_HI, 9);

        dispatch(&mut img, &mut buf).unwrap();
        assert_eq!(buf[2], 2); // byte count = ceil(9/8)
        assert_eq!(buf[3], 0b0100_1011); // coils 2,3 -> bits 0,1; coil 5 -> bit 3; coil 8 -> bit 6
        assert_eq!(buf[4], 0b0000_0001); // coil 10 is index 8 within this request -> bit 0
    }

    #[test]
    fn fc16_reply_truncates_quantity() {
        let (c, d, h, i) = image(1, 16);
        let mut img = RegisterImage::new(leak(c), leak(d), leak(h), leak(i));

        let mut buf = [0u8; 16];
        buf[offset::ID] = 1;
        buf[offset::FUNC] = 16;
        write_u16(&mut buf, offset::ADD_HI, 4);
        write_u16(&mut buf, offset::NB_HI, 2);
        buf[offset::BYTE_CNT] = 4;
        write_u16(&mut buf, 7, 0xAA55);
        write_u16(&mut buf, 9, 0x1234);

        dispatch(&mut img, &mut buf).unwrap();
        assert_eq!(img.holding(4), 0xAA55);
        assert_eq!(img.holding(5), 0x1234);
        assert_eq!(&buf[..6], &[1, 16, 0, 4, 0, 2]);
    }

    #[test]
    fn address_out_of_range_is_illegal_address() {
        let (c, d, h, i) = image(1, 4);
        let mut img = RegisterImage::new(leak(c), leak(d), leak(h), leak(i));

        let mut buf = [0u8; 16];
        buf[offset::FUNC] = 3;
        write_u16(&mut buf, offset::ADD_HI, 0);
        write_u16(&mut buf, offset::NB_HI, 10);

        assert_eq!(dispatch(&mut img, &mut buf), Err(ExceptionCode::IllegalDataAddress));
    }
}
