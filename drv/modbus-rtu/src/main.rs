// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Modbus RTU worker task. Owns a `modbus_core::Handler`, wires it to
//! the (out of scope) UART and drive-enable GPIO driver tasks, and serves
//! both the timer/RX-ready notifications and the `drv-modbus-rtu-api`
//! IPC surface.
//!
//! Bytes arrive indirectly: the UART task posts `RX_READY_NOTIFICATION_BIT`
//! whenever it has buffered received bytes, and this task drains them with
//! repeated `take_rx_byte` calls before handing each one to the handler.
//! This exists because the UART driver is a separate task with no shared
//! memory with this one (see `drv-modbus-rtu-uart-api`); the handler itself
//! just wants bytes fed to it, the way `drv-stm32h7-usart` feeds its own
//! handler from an ISR instead.

#![no_std]
#![no_main]

use ringbuf::{counted_ringbuf, ringbuf_entry};
use userlib::*;
use zerocopy::{AsBytes, FromBytes};

use modbus_core::{DriveEnable, Handler, HandlerConfig, RegisterImage, Role, Telegram, UartTransport, WorkerEvent};
use modbus_proto::ModbusError;

use drv_modbus_rtu_gpio_api::DriveEnablePin;
use drv_modbus_rtu_uart_api::ModbusUart;

task_slot!(UART, modbus_rtu_uart);
task_slot!(DRIVE_ENABLE, modbus_rtu_gpio);

const MAX_FRAME: usize = modbus_proto::frame::MAX_FRAME;
const MAX_TELEGRAMS: usize = 4;
const MAX_WORDS: usize = 125;

const COIL_WORDS: usize = 8;
const DISCRETE_WORDS: usize = 8;
const HOLDING_WORDS: usize = 64;
const INPUT_WORDS: usize = 64;

// Fixed at build time: this image is a Slave responder at station 1. A
// Master build would set ROLE = Role::Master, STATION_ID = 0, and a nonzero
// TIMEOUT_TICKS (see HandlerConfig::validate). Without an app.toml-driven
// config layer in this workspace (section 7.2), these are plain consts
// rather than something read out of board configuration.
const ROLE: Role = Role::Slave;
const STATION_ID: u8 = 1;
const T35_TICKS: u64 = 2;
const TIMEOUT_TICKS: u64 = 200;

const TIMER_NOTIFICATION_BIT: u8 = 1;
const RX_NOTIFICATION_BIT: u8 = drv_modbus_rtu_uart_api::RX_READY_NOTIFICATION_BIT;

type Caller = hl::Caller<()>;
type ModbusHandler = Handler<UartAdapter, DriveAdapter, Caller, MAX_FRAME, MAX_TELEGRAMS, MAX_WORDS>;

struct UartAdapter(ModbusUart);

impl UartTransport for UartAdapter {
    fn begin_transmit(&mut self, buf: &[u8]) {
        let _ = self.0.begin_transmit(buf);
    }

    fn transmit_complete(&mut self) -> bool {
        self.0.transmit_complete()
    }

    fn set_receive_mode(&mut self) {
        self.0.set_receive_mode();
    }

    fn set_transmit_mode(&mut self) {
        self.0.set_transmit_mode();
    }
}

struct DriveAdapter(DriveEnablePin);

impl DriveEnable for DriveAdapter {
    fn set_high(&mut self) {
        let _ = self.0.set_high();
    }

    fn set_low(&mut self) {
        let _ = self.0.set_low();
    }
}

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

/// One entry per state transition named in spec.md section 4.11, to the
/// extent it's observable from the handler's public API; the handler's own
/// internal send/validate steps aren't surfaced to the worker and so aren't
/// individually traced here (see DESIGN.md).
#[derive(Copy, Clone, Debug, PartialEq, Eq, counters::Count)]
enum Trace {
    #[count(skip)]
    None,
    Started,
    FrameReceived(usize),
    SlaveReplySent(usize),
    MasterQueryOk(u8),
    MasterQueryErr(u8),
    MasterTimeout,
    QueueFull,
}
counted_ringbuf!(Trace, 32, Trace::None);

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct Unit;

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct QueryRequestWire {
    station: u8,
    function: u8,
    _pad: u16,
    address: u16,
    quantity: u16,
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct AddressReq {
    address: u16,
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct WriteCoilReq {
    address: u16,
    value: u8,
    _pad: u8,
}

#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct WriteHoldingReq {
    address: u16,
    value: u16,
}

#[export_name = "main"]
fn main() -> ! {
    let (coils, discretes, holding, input) = mutable_statics::mutable_statics! {
        static mut COILS: [u16; COIL_WORDS] = [Default::default; _];
        static mut DISCRETES: [u16; DISCRETE_WORDS] = [Default::default; _];
        static mut HOLDING: [u16; HOLDING_WORDS] = [Default::default; _];
        static mut INPUT: [u16; INPUT_WORDS] = [Default::default; _];
    };
    let image = RegisterImage::new(coils, discretes, holding, input);

    let uart = UartAdapter(ModbusUart::from(UART.get_task_id()));
    let drive = DriveAdapter(DriveEnablePin::from(DRIVE_ENABLE.get_task_id()));
    let uart_client = ModbusUart::from(UART.get_task_id());

    let config = HandlerConfig {
        role: ROLE,
        station_id: STATION_ID,
        t35_ticks: T35_TICKS,
        timeout_ticks: TIMEOUT_TICKS,
    };

    let mut handler: ModbusHandler = Handler::new(config, uart, drive, image, TIMER_NOTIFICATION_BIT);
    handler.start();
    ringbuf_entry!(Trace::Started);

    let mask = handler.notification_mask() | (1 << RX_NOTIFICATION_BIT);
    let mut buffer = [0u8; core::mem::size_of::<QueryRequestWire>()];

    loop {
        hl::recv(
            &mut buffer,
            mask,
            &mut handler,
            |handler, bits| {
                let now = sys_get_timer().now;

                if bits & (1 << RX_NOTIFICATION_BIT) != 0 {
                    let mut received = 0usize;
                    while let Some(byte) = uart_client.take_rx_byte() {
                        handler.on_rx_byte(byte, now);
                        received += 1;
                    }
                    if received > 0 {
                        ringbuf_entry!(Trace::FrameReceived(received));
                    }
                }

                if bits & handler.notification_mask() != 0 {
                    handler.handle_timer_notification(bits);
                }

                let event = handler.poll(now);
                dispatch_event(event);
                pump(handler, now);
            },
            |handler, op, msg| -> Result<(), ModbusError> {
                let now = sys_get_timer().now;
                match op {
                    Operation::Start => {
                        let (_, caller) = msg.fixed::<Unit, ()>().ok_or(ModbusError::BadSize)?;
                        handler.start();
                        ringbuf_entry!(Trace::Started);
                        pump(handler, now);
                        caller.reply(());
                        Ok(())
                    }

                    Operation::Query | Operation::QueryInject => {
                        let (req, caller) =
                            msg.fixed_with_leases::<QueryRequestWire, ()>(1).ok_or(ModbusError::BadSize)?;
                        let station = req.station;
                        let function = req.function;
                        let address = req.address;
                        let quantity = req.quantity;

                        let borrow = caller.borrow(0);
                        let info = borrow.info().ok_or(ModbusError::BadSize)?;
                        let word_count = (info.len / 2).min(MAX_WORDS);
                        let mut raw = [0u8; MAX_WORDS * 2];
                        borrow
                            .read_fully_at(0, &mut raw[..2 * word_count])
                            .ok_or(ModbusError::BadSize)?;
                        let mut words = [0u16; MAX_WORDS];
                        for i in 0..word_count {
                            words[i] = u16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);
                        }

                        let telegram = Telegram::new(station, function, address, quantity, words, caller);
                        let enqueued = if op == Operation::Query {
                            handler.query(telegram)
                        } else {
                            handler.query_inject(telegram)
                        };
                        match enqueued {
                            Ok(()) => {
                                pump(handler, now);
                                Ok(())
                            }
                            Err((e, telegram)) => {
                                ringbuf_entry!(Trace::QueueFull);
                                telegram.caller.reply_fail(e);
                                Ok(())
                            }
                        }
                    }

                    Operation::ReadCoil => {
                        let (req, caller) = msg.fixed::<AddressReq, u8>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value = handler.with_registers(|img| (addr < img.sizes().coils).then(|| img.coil(addr)));
                        let value = value.ok_or(ModbusError::BadSize)?;
                        caller.reply(value as u8);
                        Ok(())
                    }

                    Operation::WriteCoil => {
                        let (req, caller) = msg.fixed::<WriteCoilReq, ()>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value = req.value != 0;
                        let ok = handler.with_registers_mut(|img| {
                            if addr < img.sizes().coils {
                                img.set_coil(addr, value);
                                true
                            } else {
                                false
                            }
                        });
                        if !ok {
                            return Err(ModbusError::BadSize);
                        }
                        caller.reply(());
                        Ok(())
                    }

                    Operation::ReadDiscrete => {
                        let (req, caller) = msg.fixed::<AddressReq, u8>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value =
                            handler.with_registers(|img| (addr < img.sizes().discretes).then(|| img.discrete(addr)));
                        let value = value.ok_or(ModbusError::BadSize)?;
                        caller.reply(value as u8);
                        Ok(())
                    }

                    Operation::ReadHolding => {
                        let (req, caller) = msg.fixed::<AddressReq, u16>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value =
                            handler.with_registers(|img| (addr < img.sizes().holding).then(|| img.holding(addr)));
                        let value = value.ok_or(ModbusError::BadSize)?;
                        caller.reply(value);
                        Ok(())
                    }

                    Operation::WriteHolding => {
                        let (req, caller) = msg.fixed::<WriteHoldingReq, ()>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value = req.value;
                        let ok = handler.with_registers_mut(|img| {
                            if addr < img.sizes().holding {
                                img.set_holding(addr, value);
                                true
                            } else {
                                false
                            }
                        });
                        if !ok {
                            return Err(ModbusError::BadSize);
                        }
                        caller.reply(());
                        Ok(())
                    }

                    Operation::ReadInput => {
                        let (req, caller) = msg.fixed::<AddressReq, u16>().ok_or(ModbusError::BadSize)?;
                        let addr = req.address as usize;
                        let value = handler.with_registers(|img| (addr < img.sizes().input).then(|| img.input(addr)));
                        let value = value.ok_or(ModbusError::BadSize)?;
                        caller.reply(value);
                        Ok(())
                    }
                }
            },
        );
    }
}

/// Attempts to drain queued Master telegrams, bounded to one pass over the
/// queue: each call either starts a send (handler goes `Waiting`, outcome
/// arrives later via `poll`), finds the queue empty, or fails immediately
/// and moves on to the next telegram.
fn pump(handler: &mut ModbusHandler, now: u64) {
    for _ in 0..MAX_TELEGRAMS {
        match handler.try_send_next(now) {
            Some(event) => dispatch_event(event),
            None => break,
        }
    }
}

fn dispatch_event(event: WorkerEvent<Caller, MAX_WORDS>) {
    match event {
        WorkerEvent::None => {}
        WorkerEvent::SlaveReplySent { length } => {
            ringbuf_entry!(Trace::SlaveReplySent(length));
        }
        WorkerEvent::MasterOutcome(outcome) => match outcome.result {
            Ok(()) => {
                ringbuf_entry!(Trace::MasterQueryOk(outcome.function));
                let borrow = outcome.caller.borrow(0);
                if let Some(info) = borrow.info() {
                    let word_count = (info.len / 2).min(MAX_WORDS);
                    let mut raw = [0u8; MAX_WORDS * 2];
                    for i in 0..word_count {
                        let b = outcome.words[i].to_be_bytes();
                        raw[2 * i] = b[0];
                        raw[2 * i + 1] = b[1];
                    }
                    let _ = borrow.write_fully_at(0, &raw[..2 * word_count]);
                }
                outcome.caller.reply(());
            }
            Err(e) => {
                if e == ModbusError::TimeOut {
                    ringbuf_entry!(Trace::MasterTimeout);
                } else {
                    ringbuf_entry!(Trace::MasterQueryErr(e as u8));
                }
                outcome.caller.reply_fail(e);
            }
        },
    }
}
