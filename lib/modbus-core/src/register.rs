// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The register image: coils, discrete inputs, holding registers and input
//! registers, each an ordered sequence of 16-bit words. A coil or discrete
//! input `c` lives in word `c/16`, bit `c%16`.

#[derive(Copy, Clone, Debug)]
pub struct RegisterSizes {
    pub coils: usize,
    pub discretes: usize,
    pub holding: usize,
    pub input: usize,
}

pub struct RegisterImage {
    coils: &'static mut [u16],
    discretes: &'static mut [u16],
    holding: &'static mut [u16],
    input: &'static mut [u16],
}

fn bit(words: &[u16], i: usize) -> bool {
    words[i / 16] & (1 << (i % 16)) != 0
}

fn set_bit(words: &mut [u16], i: usize, v: bool) {
    if v {
        words[i / 16] |= 1 << (i % 16);
    } else {
        words[i / 16] &= !(1 << (i % 16));
    }
}

impl RegisterImage {
    pub fn new(
        coils: &'static mut [u16],
        discretes: &'static mut [u16],
        holding: &'static mut [u16],
        input: &'static mut [u16],
    ) -> Self {
        Self {
            coils,
            discretes,
            holding,
            input,
        }
    }

    /// Capacities in the unit each array is addressed by: bits for the coil
    /// arrays, words for the register arrays.
    pub fn sizes(&self) -> RegisterSizes {
        RegisterSizes {
            coils: self.coils.len() * 16,
            discretes: self.discretes.len() * 16,
            holding: self.holding.len(),
            input: self.input.len(),
        }
    }

    pub fn coil(&self, i: usize) -> bool {
        bit(self.coils, i)
    }

    pub fn set_coil(&mut self, i: usize, v: bool) {
        set_bit(self.coils, i, v)
    }

    pub fn discrete(&self, i: usize) -> bool {
        bit(self.discretes, i)
    }

    /// Discrete inputs are read-only over Modbus; this exists so application
    /// code and tests can seed the image from whatever actually produces the
    /// inputs (sensors, a simulator).
    pub fn set_discrete(&mut self, i: usize, v: bool) {
        set_bit(self.discretes, i, v)
    }

    pub fn holding(&self, i: usize) -> u16 {
        self.holding[i]
    }

    pub fn set_holding(&mut self, i: usize, v: u16) {
        self.holding[i] = v;
    }

    pub fn input(&self, i: usize) -> u16 {
        self.input[i]
    }

    pub fn set_input(&mut self, i: usize, v: u16) {
        self.input[i] = v;
    }
}
