// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `Handler` state machine: the piece that owns a register image, a
//! half-duplex UART, the T3.5/Timeout timers, and (for a Master) the
//! telegram queue, and drives both roles' worker loops.
//!
//! `Handler` does not call into the scheduler itself. It is driven entirely
//! by its caller feeding in bytes (`on_rx_byte`), timer notifications
//! (`handle_timer_notification`) and an explicit `now` tick count on every
//! call that needs one. This keeps the state machine host-testable: the
//! real worker task (`drv-modbus-rtu`) is the only place that reads the
//! actual tick count (`userlib::sys_get_timer()`) or a real byte off the
//! wire.
//!
//! `Multitimer` is still used to arm the real OS-backed one-shot timers (so
//! the worker task's `hl::recv` actually wakes up at roughly the right
//! tick), but the decision of *which* timer has fired is made here against
//! the caller-supplied `now`, not by asking `Multitimer` — its internal
//! clock is a module-private test fake on host builds, unreachable from
//! this crate. See DESIGN.md.

use core::cell::RefCell;

use critical_section::Mutex;
use enum_map::Enum;
use modbus_proto::frame::{self, offset, read_u16, write_u16};
use modbus_proto::{validate, ModbusError};
use multitimer::Multitimer;

use crate::functions;
use crate::register::RegisterImage;
use crate::telegram::{Telegram, TelegramQueue};
use crate::transport::{DriveEnable, UartTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Enum)]
pub enum ModbusTimer {
    T35,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MasterState {
    Idle,
    Waiting,
}

#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    pub role: Role,
    /// 1..=247 for a Slave, 0 for a Master.
    pub station_id: u8,
    pub t35_ticks: u64,
    pub timeout_ticks: u64,
}

impl HandlerConfig {
    fn validate(&self) {
        match self.role {
            Role::Slave => assert!(
                (1..=247).contains(&self.station_id),
                "slave station id must be 1..=247"
            ),
            Role::Master => assert_eq!(self.station_id, 0, "master station id must be 0"),
        }
        assert!(self.t35_ticks > 0, "t35_ticks must be nonzero");
        if matches!(self.role, Role::Master) {
            assert!(self.timeout_ticks > 0, "timeout_ticks must be nonzero for a master");
        }
    }
}

/// The outcome of a completed Master query, handed to the worker so it can
/// notify the originating caller task.
#[derive(Debug)]
pub struct MasterOutcome<C, const MAX_WORDS: usize> {
    pub caller: C,
    pub function: u8,
    pub result: Result<(), ModbusError>,
    pub words: [u16; MAX_WORDS],
}

/// What happened as a result of feeding the handler a byte, a timer
/// notification, or a `poll`. Replaces the source's in-band sentinel
/// (notification value 0 vs. an error code) with a tagged variant, per the
/// redesign note on in-band sentinels.
pub enum WorkerEvent<C, const MAX_WORDS: usize> {
    None,
    /// A Slave reply (or exception reply) was sent; `length` is on-wire
    /// byte count including CRC.
    SlaveReplySent { length: usize },
    MasterOutcome(MasterOutcome<C, MAX_WORDS>),
}

pub struct Handler<U, G, C, const MAX_FRAME: usize, const MAX_TELEGRAMS: usize, const MAX_WORDS: usize> {
    config: HandlerConfig,
    uart: U,
    drive_enable: G,
    image: Mutex<RefCell<RegisterImage>>,
    rx_ring: modbus_ring::RingBuffer<MAX_FRAME>,
    work: [u8; MAX_FRAME],
    last_error: ModbusError,
    in_count: u32,
    out_count: u32,
    err_count: u32,
    notification_bit: u8,
    timers: Multitimer<ModbusTimer>,
    t35_deadline: Option<u64>,
    timeout_deadline: Option<u64>,
    master_state: MasterState,
    current: Option<Telegram<C, MAX_WORDS>>,
    queue: TelegramQueue<C, MAX_TELEGRAMS, MAX_WORDS>,
}

impl<U, G, C, const MAX_FRAME: usize, const MAX_TELEGRAMS: usize, const MAX_WORDS: usize>
    Handler<U, G, C, MAX_FRAME, MAX_TELEGRAMS, MAX_WORDS>
where
    U: UartTransport,
    G: DriveEnable,
{
    /// Validates `config` and the register image, then builds a Handler in
    /// its constructed-but-not-started state. `notification_bit` is the bit
    /// this handler's timers will use in the worker's notification mask;
    /// callers build `hl::recv`'s mask from [`Handler::notification_mask`].
    ///
    /// Panics (the "fatal at init" policy from the error handling design)
    /// if `config` is inconsistent.
    pub fn new(config: HandlerConfig, uart: U, drive_enable: G, image: RegisterImage, notification_bit: u8) -> Self {
        config.validate();
        Self {
            config,
            uart,
            drive_enable,
            image: Mutex::new(RefCell::new(image)),
            rx_ring: modbus_ring::RingBuffer::new(),
            work: [0; MAX_FRAME],
            last_error: ModbusError::OkQuery,
            in_count: 0,
            out_count: 0,
            err_count: 0,
            notification_bit,
            timers: Multitimer::new(notification_bit),
            t35_deadline: None,
            timeout_deadline: None,
            master_state: MasterState::Idle,
            current: None,
            queue: TelegramQueue::new(),
        }
    }

    /// Places the line in receive mode and zeroes the counters. Does not
    /// arm any timer; the first received byte does that.
    pub fn start(&mut self) {
        self.uart.set_receive_mode();
        self.rx_ring.clear();
        self.in_count = 0;
        self.out_count = 0;
        self.err_count = 0;
    }

    pub fn notification_mask(&self) -> u32 {
        1 << self.notification_bit
    }

    pub fn last_error(&self) -> ModbusError {
        self.last_error
    }

    pub fn counters(&self) -> (u32, u32, u32) {
        (self.in_count, self.out_count, self.err_count)
    }

    pub fn with_registers<R>(&self, f: impl FnOnce(&RegisterImage) -> R) -> R {
        critical_section::with(|cs| f(&self.image.borrow(cs).borrow()))
    }

    pub fn with_registers_mut<R>(&self, f: impl FnOnce(&mut RegisterImage) -> R) -> R {
        critical_section::with(|cs| f(&mut self.image.borrow(cs).borrow_mut()))
    }

    /// Feeds one received byte in and re-arms T3.5. Called from the UART RX
    /// path (IT mode byte-at-a-time, or copied out of a DMA buffer on an
    /// idle-line event).
    pub fn on_rx_byte(&mut self, byte: u8, now: u64) {
        self.rx_ring.push(byte);
        let deadline = now + self.config.t35_ticks;
        self.t35_deadline = Some(deadline);
        self.timers.set_timer(ModbusTimer::T35, deadline, None);
    }

    /// Feeds a timer notification in. Does not by itself decide whether a
    /// timer fired (see module docs); callers must still call `poll` to
    /// collect the resulting event. Present so the worker can hand
    /// `Multitimer` notification bits through uniformly even though this
    /// handler's own firing decision is made against `now`.
    pub fn handle_timer_notification(&mut self, bits: u32) {
        self.timers.handle_notification(bits);
        for _ in self.timers.iter_fired() {
            // Firing is tracked by this handler's own deadlines; draining
            // Multitimer's fired set here just keeps it from accumulating
            // stale entries between calls.
        }
    }

    /// Checks whether T3.5 or Timeout has elapsed as of `now`, and if so
    /// runs the resulting protocol step. T3.5 is checked first: if both
    /// have elapsed in the same tick, the frame-ready path wins, matching
    /// the ordering guarantee in the concurrency model.
    pub fn poll(&mut self, now: u64) -> WorkerEvent<C, MAX_WORDS> {
        if let Some(deadline) = self.t35_deadline {
            if now >= deadline {
                self.t35_deadline = None;
                self.timers.clear_timer(ModbusTimer::T35);
                if self.master_state == MasterState::Waiting {
                    self.timeout_deadline = None;
                    self.timers.clear_timer(ModbusTimer::Timeout);
                }
                return self.on_frame_ready(now);
            }
        }
        if let Some(deadline) = self.timeout_deadline {
            if now >= deadline {
                self.timeout_deadline = None;
                self.timers.clear_timer(ModbusTimer::Timeout);
                return self.on_timeout();
            }
        }
        WorkerEvent::None
    }

    fn on_frame_ready(&mut self, now: u64) -> WorkerEvent<C, MAX_WORDS> {
        let len = self.rx_ring.drain_into(&mut self.work);
        match self.config.role {
            Role::Slave => self.process_slave_frame(len),
            Role::Master => self.process_master_reply(len, now),
        }
    }

    fn process_slave_frame(&mut self, len: usize) -> WorkerEvent<C, MAX_WORDS> {
        if let Err(e) = validate::check_basic_slave(&self.work[..len.min(MAX_FRAME)]) {
            self.last_error = e;
            self.err_count += 1;
            return WorkerEvent::None;
        }
        if self.work[offset::ID] != self.config.station_id {
            // Silent drop: not addressed to us. last_error untouched.
            return WorkerEvent::None;
        }
        self.in_count += 1;
        let id = self.work[offset::ID];
        let func = self.work[offset::FUNC];

        if frame::FunctionCode::from_u8(func).is_none() {
            let elen = frame::build_exception(&mut self.work, id, func, frame::ExceptionCode::IllegalFunction);
            return self.finish_slave_send(elen);
        }

        let outcome = critical_section::with(|cs| {
            let mut image = self.image.borrow(cs).borrow_mut();
            functions::dispatch(&mut image, &mut self.work)
        });
        match outcome {
            Ok(reply_len) => self.finish_slave_send(reply_len),
            Err(exc) => {
                let elen = frame::build_exception(&mut self.work, id, func, exc);
                self.finish_slave_send(elen)
            }
        }
    }

    fn finish_slave_send(&mut self, len: usize) -> WorkerEvent<C, MAX_WORDS> {
        match self.send(len) {
            Ok(()) => WorkerEvent::SlaveReplySent { length: len },
            Err(e) => {
                self.last_error = e;
                self.err_count += 1;
                WorkerEvent::None
            }
        }
    }

    fn process_master_reply(&mut self, len: usize, _now: u64) -> WorkerEvent<C, MAX_WORDS> {
        if self.master_state != MasterState::Waiting {
            // Unsolicited bytes while Idle: drained and discarded (open
            // question #4, resolved in SPEC_FULL.md / DESIGN.md).
            return WorkerEvent::None;
        }
        let telegram = match self.current.take() {
            Some(t) => t,
            None => return WorkerEvent::None,
        };
        self.master_state = MasterState::Idle;

        match validate::check_reply_master(&self.work[..len.min(MAX_FRAME)]) {
            Err(e) => {
                self.last_error = e;
                self.err_count += 1;
                WorkerEvent::MasterOutcome(MasterOutcome {
                    caller: telegram.caller,
                    function: telegram.function,
                    result: Err(e),
                    words: [0; MAX_WORDS],
                })
            }
            Ok(_func) => {
                self.in_count += 1;
                let words = self.copy_back(&telegram);
                WorkerEvent::MasterOutcome(MasterOutcome {
                    caller: telegram.caller,
                    function: telegram.function,
                    result: Ok(()),
                    words,
                })
            }
        }
    }

    /// FC1/FC2: the first reply byte goes into the high half of caller
    /// word 0, the second into its low half, and so on. FC3/FC4: copy
    /// big-endian pairs straight into successive caller words. Write FCs
    /// need no copy-back.
    fn copy_back(&self, telegram: &Telegram<C, MAX_WORDS>) -> [u16; MAX_WORDS] {
        let mut words = [0u16; MAX_WORDS];
        match telegram.function {
            1 | 2 => {
                let byte_count = self.work[2] as usize;
                for (i, &b) in self.work[3..3 + byte_count].iter().enumerate() {
                    let word = i / 2;
                    if word >= MAX_WORDS {
                        break;
                    }
                    if i % 2 == 0 {
                        words[word] = (b as u16) << 8;
                    } else {
                        words[word] |= b as u16;
                    }
                }
            }
            3 | 4 => {
                let byte_count = self.work[2] as usize;
                let qty = (byte_count / 2).min(MAX_WORDS);
                for i in 0..qty {
                    words[i] = read_u16(&self.work, 3 + 2 * i);
                }
            }
            _ => {}
        }
        words
    }

    fn on_timeout(&mut self) -> WorkerEvent<C, MAX_WORDS> {
        if self.master_state != MasterState::Waiting {
            return WorkerEvent::None;
        }
        let telegram = match self.current.take() {
            Some(t) => t,
            None => return WorkerEvent::None,
        };
        self.master_state = MasterState::Idle;
        self.err_count += 1;
        self.last_error = ModbusError::TimeOut;
        WorkerEvent::MasterOutcome(MasterOutcome {
            caller: telegram.caller,
            function: telegram.function,
            result: Err(ModbusError::TimeOut),
            words: [0; MAX_WORDS],
        })
    }

    /// Half-duplex line turnaround: drive-enable high, kick the transmit,
    /// busy-wait for the shift register to empty (bounded), drive-enable
    /// low, back to receive. The CRC is already in `self.work` — every
    /// caller of `send` builds it via `modbus_proto::crc::append` first.
    fn send(&mut self, len: usize) -> Result<(), ModbusError> {
        self.drive_enable.set_high();
        self.uart.set_transmit_mode();
        self.uart.begin_transmit(&self.work[..len]);

        const MAX_SPIN: u32 = 1 << 20;
        let mut spins = 0u32;
        while !self.uart.transmit_complete() {
            spins += 1;
            if spins > MAX_SPIN {
                self.drive_enable.set_low();
                self.uart.set_receive_mode();
                return Err(ModbusError::TxStall);
            }
        }

        self.drive_enable.set_low();
        self.uart.set_receive_mode();
        self.out_count += 1;
        Ok(())
    }

    /// Enqueues a Master query. Rejected for a Slave handler, or if the
    /// station id is out of range; the telegram queue rejects it directly
    /// if full. On any rejection the telegram (and the caller handle it
    /// carries) is handed back rather than dropped, so a worker using a
    /// deferred-reply `C` can still fail the caller instead of leaving it
    /// blocked forever.
    pub fn query(
        &mut self,
        telegram: Telegram<C, MAX_WORDS>,
    ) -> Result<(), (ModbusError, Telegram<C, MAX_WORDS>)> {
        if let Err(e) = self.check_master_query(&telegram) {
            return Err((e, telegram));
        }
        self.queue.push_back(telegram).map_err(|t| (ModbusError::QueueFull, t))
    }

    /// Clears the queue, then enqueues `telegram` at the head. The source
    /// does not check the role here; this does (open question #3).
    pub fn query_inject(
        &mut self,
        telegram: Telegram<C, MAX_WORDS>,
    ) -> Result<(), (ModbusError, Telegram<C, MAX_WORDS>)> {
        if let Err(e) = self.check_master_query(&telegram) {
            return Err((e, telegram));
        }
        while self.queue.pop_front().is_some() {}
        self.queue.push_front(telegram).map_err(|t| (ModbusError::QueueFull, t))
    }

    fn check_master_query(&self, telegram: &Telegram<C, MAX_WORDS>) -> Result<(), ModbusError> {
        if self.config.role != Role::Master {
            return Err(ModbusError::NotMaster);
        }
        if telegram.station == 0 || telegram.station > 247 {
            return Err(ModbusError::BadSlaveId);
        }
        // Defensive parity with the source's mutex-acquire-time check; the
        // worker pump below never calls this while Waiting, but query()
        // can race an in-flight send from another task's point of view.
        if self.master_state == MasterState::Waiting && self.queue.is_full() {
            return Err(ModbusError::Polling);
        }
        Ok(())
    }

    /// Sends the next queued telegram if the handler is Idle. Returns
    /// `Some` only when the send attempt itself failed (a build/transmit
    /// error delivered to the caller immediately); a successful send
    /// transitions to Waiting and the outcome arrives later via `poll`.
    /// The worker should call this after `start`, after every successful
    /// `query`/`query_inject`, and after every event that returns the
    /// handler to Idle.
    pub fn try_send_next(&mut self, now: u64) -> Option<WorkerEvent<C, MAX_WORDS>> {
        if self.config.role != Role::Master || self.master_state != MasterState::Idle {
            return None;
        }
        let telegram = self.queue.pop_front()?;
        let len = self.build_request(&telegram);
        match self.send(len) {
            Ok(()) => {
                let deadline = now + self.config.timeout_ticks;
                self.timeout_deadline = Some(deadline);
                self.timers.set_timer(ModbusTimer::Timeout, deadline, None);
                self.master_state = MasterState::Waiting;
                self.current = Some(telegram);
                None
            }
            Err(e) => {
                self.err_count += 1;
                Some(WorkerEvent::MasterOutcome(MasterOutcome {
                    caller: telegram.caller,
                    function: telegram.function,
                    result: Err(e),
                    words: [0; MAX_WORDS],
                }))
            }
        }
    }

    fn build_request(&mut self, telegram: &Telegram<C, MAX_WORDS>) -> usize {
        self.work[offset::ID] = telegram.station;
        self.work[offset::FUNC] = telegram.function;
        write_u16(&mut self.work, offset::ADD_HI, telegram.address);

        match telegram.function {
            1 | 2 | 3 | 4 => {
                write_u16(&mut self.work, offset::NB_HI, telegram.quantity);
                modbus_proto::crc::append(&mut self.work, 6)
            }
            5 => {
                let value = if telegram.words[0] != 0 { 0xFF00u16 } else { 0x0000u16 };
                write_u16(&mut self.work, offset::NB_HI, value);
                modbus_proto::crc::append(&mut self.work, 6)
            }
            6 => {
                write_u16(&mut self.work, offset::NB_HI, telegram.words[0]);
                modbus_proto::crc::append(&mut self.work, 6)
            }
            15 => {
                let qty = telegram.quantity as usize;
                write_u16(&mut self.work, offset::NB_HI, telegram.quantity);
                let byte_count = (qty + 7) / 8;
                self.work[offset::BYTE_CNT] = byte_count as u8;
                for b in &mut self.work[7..7 + byte_count] {
                    *b = 0;
                }
                for i in 0..qty {
                    let word = telegram.words[i / 16];
                    if (word >> (i % 16)) & 1 != 0 {
                        self.work[7 + i / 8] |= 1 << (i % 8);
                    }
                }
                modbus_proto::crc::append(&mut self.work, 7 + byte_count)
            }
            16 => {
                let qty = telegram.quantity as usize;
                write_u16(&mut self.work, offset::NB_HI, telegram.quantity);
                let byte_count = qty * 2;
                self.work[offset::BYTE_CNT] = byte_count as u8;
                for i in 0..qty {
                    write_u16(&mut self.work, 7 + 2 * i, telegram.words[i]);
                }
                modbus_proto::crc::append(&mut self.work, 7 + byte_count)
            }
            _ => modbus_proto::crc::append(&mut self.work, 6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::RegisterImage;

    #[derive(Default)]
    struct FakeUart {
        sent: Vec<u8>,
        complete_after: u32,
        spins: core::cell::Cell<u32>,
    }

    impl UartTransport for FakeUart {
        fn begin_transmit(&mut self, buf: &[u8]) {
            self.sent.clear();
            self.sent.extend_from_slice(buf);
            self.spins.set(0);
        }
        fn transmit_complete(&mut self) -> bool {
            let n = self.spins.get() + 1;
            self.spins.set(n);
            n >= self.complete_after
        }
        fn set_receive_mode(&mut self) {}
        fn set_transmit_mode(&mut self) {}
    }

    #[derive(Default)]
    struct FakeDrive {
        high: bool,
    }

    impl DriveEnable for FakeDrive {
        fn set_high(&mut self) {
            self.high = true;
        }
        fn set_low(&mut self) {
            self.high = false;
        }
    }

    fn image(coil_words: usize, holding_words: usize) -> RegisterImage {
        RegisterImage::new(
            Box::leak(vec![0u16; coil_words].into_boxed_slice()),
            Box::leak(vec![0u16; coil_words].into_boxed_slice()),
            Box::leak(vec![0u16; holding_words].into_boxed_slice()),
            Box::leak(vec![0u16; holding_words].into_boxed_slice()),
        )
    }

    fn slave(station: u8) -> Handler<FakeUart, FakeDrive, u32, 256, 4, 8> {
        let config = HandlerConfig {
            role: Role::Slave,
            station_id: station,
            t35_ticks: 10,
            timeout_ticks: 0,
        };
        let mut h = Handler::new(
            config,
            FakeUart {
                complete_after: 1,
                ..Default::default()
            },
            FakeDrive::default(),
            image(1, 16),
            0,
        );
        h.start();
        h
    }

    fn feed(h: &mut Handler<FakeUart, FakeDrive, u32, 256, 4, 8>, bytes: &[u8], t0: u64) -> WorkerEvent<u32, 8> {
        let mut now = t0;
        for &b in bytes {
            h.on_rx_byte(b, now);
            now += 1;
        }
        h.poll(now + 11)
    }

    #[test]
    fn slave_fc3_byte_exact() {
        let mut h = slave(1);
        h.with_registers_mut(|img| {
            for i in 0..10u16 {
                img.set_holding(i as usize, i);
            }
        });
        let request = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        match feed(&mut h, &request, 0) {
            WorkerEvent::SlaveReplySent { length } => {
                let expected = [
                    0x01, 0x03, 0x14, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x05, 0x00,
                    0x06, 0x00, 0x07, 0x00, 0x08, 0x00, 0x09,
                ];
                assert_eq!(&h.uart.sent[..expected.len()], &expected[..]);
                assert!(modbus_proto::crc::check(&h.uart.sent[..length]));
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn slave_fc6_echoes_and_writes() {
        let mut h = slave(2);
        let request = [0x02, 0x06, 0x00, 0x05, 0x12, 0x34, 0, 0];
        let mut req = request;
        let len = modbus_proto::crc::append(&mut req, 6);
        match feed(&mut h, &req[..len], 0) {
            WorkerEvent::SlaveReplySent { .. } => {
                assert_eq!(&h.uart.sent[..6], &[0x02, 0x06, 0x00, 0x05, 0x12, 0x34]);
                assert_eq!(h.with_registers(|img| img.holding(5)), 0x1234);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn slave_fc1_bit_packing() {
        let mut h = slave(1);
        h.with_registers_mut(|img| {
            for bit in [2, 3, 5, 8, 10] {
                img.set_coil(bit, true);
            }
        });
        let mut req = [0x01, 0x01, 0x00, 0x02, 0x00, 0x09, 0, 0];
        let len = modbus_proto::crc::append(&mut req, 6);
        match feed(&mut h, &req[..len], 0) {
            WorkerEvent::SlaveReplySent { .. } => {
                assert_eq!(h.uart.sent[2], 2);
                assert_eq!(h.uart.sent[3], 0b0100_1011);
                assert_eq!(h.uart.sent[4], 0b0000_0001);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn slave_fc16_reply_truncates_quantity() {
        let mut h = slave(1);
        let mut req = [0x01, 0x10, 0x00, 0x04, 0x00, 0x02, 0x04, 0xAA, 0x55, 0x12, 0x34, 0, 0];
        let len = modbus_proto::crc::append(&mut req, 11);
        match feed(&mut h, &req[..len], 0) {
            WorkerEvent::SlaveReplySent { .. } => {
                assert_eq!(&h.uart.sent[..6], &[0x01, 0x10, 0x00, 0x04, 0x00, 0x02]);
                assert_eq!(h.with_registers(|img| img.holding(4)), 0xAA55);
                assert_eq!(h.with_registers(|img| img.holding(5)), 0x1234);
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn slave_bad_crc_is_silent() {
        let mut h = slave(1);
        let mut req = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        req[7] ^= 0xFF;
        let (_, _, err0) = h.counters();
        match feed(&mut h, &req, 0) {
            WorkerEvent::None => {}
            _ => panic!("bad CRC must not produce a reply"),
        }
        assert_eq!(h.last_error(), ModbusError::BadCrc);
        let (_, _, err1) = h.counters();
        assert_eq!(err1, err0 + 1);
    }

    #[test]
    fn slave_station_mismatch_is_silent_and_does_not_touch_last_error() {
        let mut h = slave(1);
        let mut req = [0x09, 0x03, 0x00, 0x00, 0x00, 0x0A, 0, 0];
        let len = modbus_proto::crc::append(&mut req, 6);
        let before = h.last_error();
        match feed(&mut h, &req[..len], 0) {
            WorkerEvent::None => {}
            _ => panic!("frame for another station must not reply"),
        }
        assert_eq!(h.last_error(), before);
    }

    fn master() -> Handler<FakeUart, FakeDrive, u32, 256, 4, 8> {
        let config = HandlerConfig {
            role: Role::Master,
            station_id: 0,
            t35_ticks: 10,
            timeout_ticks: 100,
        };
        let mut h = Handler::new(
            config,
            FakeUart {
                complete_after: 1,
                ..Default::default()
            },
            FakeDrive::default(),
            image(1, 16),
            0,
        );
        h.start();
        h
    }

    #[test]
    fn master_timeout_returns_to_idle_and_notifies_caller() {
        let mut h = master();
        h.query(Telegram::new(1, 3, 0, 10, [0; 8], 42u32)).unwrap();
        assert!(h.try_send_next(0).is_none());
        match h.poll(101) {
            WorkerEvent::MasterOutcome(outcome) => {
                assert_eq!(outcome.caller, 42);
                assert_eq!(outcome.result, Err(ModbusError::TimeOut));
            }
            _ => panic!("expected a timeout outcome"),
        }
        assert!(h.try_send_next(101).is_none());
    }

    #[test]
    fn master_fc3_round_trip_copies_back_into_caller_words() {
        let mut h = master();
        h.query(Telegram::new(1, 3, 0, 3, [0; 8], 7u32)).unwrap();
        assert!(h.try_send_next(0).is_none());

        let mut reply = [0x01u8, 0x03, 0x06, 0x00, 0x0A, 0x00, 0x0B, 0x00, 0x0C, 0, 0];
        let len = modbus_proto::crc::append(&mut reply, 9);
        let mut now = 1u64;
        for &b in &reply[..len] {
            h.on_rx_byte(b, now);
            now += 1;
        }
        match h.poll(now + 11) {
            WorkerEvent::MasterOutcome(outcome) => {
                assert_eq!(outcome.caller, 7);
                assert!(outcome.result.is_ok());
                assert_eq!(&outcome.words[..3], &[0x0A, 0x0B, 0x0C]);
            }
            _ => panic!("expected a completed round trip"),
        }
    }

    #[test]
    fn queue_full_is_rejected_immediately() {
        let mut h = master();
        for i in 0..4u32 {
            h.query(Telegram::new(1, 3, 0, 1, [0; 8], i)).unwrap();
        }
        let rejected = h.query(Telegram::new(1, 3, 0, 1, [0; 8], 99));
        assert_eq!(
            rejected,
            Err((ModbusError::QueueFull, Telegram::new(1, 3, 0, 1, [0; 8], 99)))
        );
    }

    #[test]
    fn slave_rejects_query() {
        let mut h = slave(1);
        assert_eq!(
            h.query(Telegram::new(1, 3, 0, 1, [0; 8], 1u32)),
            Err((ModbusError::NotMaster, Telegram::new(1, 3, 0, 1, [0; 8], 1u32)))
        );
    }
}
