//! USB device-controller framework: composite device model, event loop,
//! setup dispatch (SPEC_FULL.md §4.4).

pub mod composite;
pub mod descriptor;
pub mod fsl_usb2;
pub mod transaction;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::UdcConfig;
use crate::error::{KErrorExt as _, KResult, KernelError};
use crate::sync::{InterruptFlag, Semaphore};

pub use composite::{Configuration, Device, Direction, Function};
pub use transaction::Transaction;

/// Device state (SPEC_FULL.md §3, UDC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Detached,
    Powered,
    Default,
    Address,
    Configured,
    Failed,
}

/// 8-byte little-endian setup packet (SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(b: [u8; 8]) -> Self {
        Self {
            bm_request_type: b[0],
            b_request: b[1],
            w_value: u16::from_le_bytes([b[2], b[3]]),
            w_index: u16::from_le_bytes([b[4], b[5]]),
            w_length: u16::from_le_bytes([b[6], b[7]]),
        }
    }
    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }
    pub fn recipient(&self) -> u8 {
        self.bm_request_type & 0x1f
    }
}

const REQ_GET_STATUS: u8 = 0x00;
const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const REQ_SET_ADDRESS: u8 = 0x05;
const REQ_GET_DESCRIPTOR: u8 = 0x06;
const REQ_SET_CONFIGURATION: u8 = 0x09;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;
const RECIPIENT_ENDPOINT: u8 = 0x02;

/// Controller-facing hardware abstraction. `fsl_usb2::Controller`
/// implements this; SPEC_FULL.md §9 replaces the C++ RTTI downcast with a
/// typed allocator by having exactly one concrete implementation instead of
/// a polymorphic base.
pub trait UdcHardware: Send + Sync {
    fn program_address(&self, addr: u8);
    fn set_stall(&self, ep: u8, dir: Direction, stall: bool);
    fn is_stalled(&self, ep: u8, dir: Direction) -> bool;
    fn reset_data_toggle(&self, ep: u8, dir: Direction);
    /// Enqueues `txn` on `ep`/`dir` (SPEC_FULL.md §4.4, "Transaction
    /// lifecycle").
    fn enqueue(&self, ep: u8, dir: Direction, txn: Arc<Transaction>) -> KResult<()>;
    /// Cancels every queued transaction on `ep`/`dir` with `-ECANCELED`
    /// (endpoint close, SPEC_FULL.md §4.4, "Failure model").
    fn cancel_all(&self, ep: u8, dir: Direction);
}

const MAX_ENDPOINTS: usize = 16;

/// The gadget-side UDC core: composite device, event loop, setup dispatch.
pub struct Udc {
    config: UdcConfig,
    device: Device,
    hw: Arc<dyn UdcHardware>,
    state: Mutex<DeviceState>,
    events: AtomicU32,
    /// 2 completion bits per endpoint (SPEC_FULL.md §3).
    completions: AtomicU32,
    current_config: Mutex<Option<u8>>,
    last_speed: Mutex<Speed>,
    setup_scratch: Mutex<[u8; 32]>,
    ep0_in: Arc<Transaction>,
    worker_wake: Semaphore,
    stop: InterruptFlag,
    running: std::sync::atomic::AtomicBool,
    address_pending: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Mutex<Weak<Udc>>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u32 {
        const RESET          = 1 << 0;
        const BUS_RESET      = 1 << 1;
        const PORT_CHANGE    = 1 << 2;
        const SETUP          = 1 << 3;
        const SETUP_ABORTED  = 1 << 4;
        const COMPLETE       = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Low,
    Full,
    High,
}
impl Default for Speed {
    fn default() -> Self {
        Speed::Full
    }
}

impl Udc {
    pub fn new(config: UdcConfig, device: Device, hw: Arc<dyn UdcHardware>) -> Arc<Self> {
        let udc = Arc::new(Self {
            config,
            device,
            hw,
            state: Mutex::new(DeviceState::Detached),
            events: AtomicU32::new(0),
            completions: AtomicU32::new(0),
            current_config: Mutex::new(None),
            last_speed: Mutex::new(Speed::default()),
            setup_scratch: Mutex::new([0u8; 32]),
            ep0_in: Arc::new(Transaction::new()),
            worker_wake: Semaphore::new(),
            stop: InterruptFlag::new(),
            running: std::sync::atomic::AtomicBool::new(true),
            address_pending: AtomicU8::new(0),
            worker: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *udc.self_ref.lock() = Arc::downgrade(&udc);
        let worker_udc = udc.clone();
        let handle = std::thread::Builder::new()
            .name("udc-worker".into())
            .spawn(move || worker_udc.worker_loop())
            .expect("spawning the UDC worker thread");
        *udc.worker.lock() = Some(handle);
        udc
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    // ---- irq-safe hooks: set bits, post the worker semaphore ----

    pub fn irq_reset(&self) {
        self.events.fetch_or(Events::RESET.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }
    pub fn irq_bus_reset(&self) {
        self.events.fetch_or(Events::BUS_RESET.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }
    pub fn irq_port_change(&self, speed: Speed) {
        *self.last_speed.lock() = speed;
        self.events.fetch_or(Events::PORT_CHANGE.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }
    pub fn irq_setup(&self, setup: [u8; 8]) {
        *self.setup_scratch.lock() = {
            let mut s = [0u8; 32];
            s[..8].copy_from_slice(&setup);
            s
        };
        self.events.fetch_or(Events::SETUP.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }
    pub fn irq_setup_aborted(&self) {
        self.events.fetch_or(Events::SETUP_ABORTED.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }
    /// Marks endpoint `ep`/`dir` as having a finished transaction. The
    /// worker drains all finished transactions of that endpoint when it
    /// wakes (SPEC_FULL.md §5, "coalesced completion").
    pub fn irq_complete(&self, ep: u8, dir: Direction) {
        let bit = 1u32 << (ep as u32 * 2 + if dir == Direction::In { 0 } else { 1 });
        self.completions.fetch_or(bit, Ordering::AcqRel);
        self.events.fetch_or(Events::COMPLETE.bits(), Ordering::AcqRel);
        self.worker_wake.post_once();
    }

    fn worker_loop(&self) {
        while self.running.load(Ordering::Acquire) && self.worker_wake.wait_interruptible(&self.stop) {
            self.drain_events();
        }
    }

    /// Drains the event word in one pass, serialising every callback into
    /// device/function code (SPEC_FULL.md §4.4, "Event loop").
    fn drain_events(&self) {
        let events = Events::from_bits_truncate(self.events.swap(0, Ordering::AcqRel));
        if events.contains(Events::RESET) || events.contains(Events::BUS_RESET) {
            *self.state.lock() = DeviceState::Default;
            *self.current_config.lock() = None;
        }
        if events.contains(Events::PORT_CHANGE) {
            let mut state = self.state.lock();
            if *state == DeviceState::Detached {
                *state = DeviceState::Powered;
            }
        }
        if events.contains(Events::SETUP_ABORTED) {
            log::debug!("setup stage aborted by the host, dropping scratch setup packet");
        }
        if events.contains(Events::SETUP) {
            let raw = *self.setup_scratch.lock();
            let setup = SetupPacket::from_bytes(raw[..8].try_into().unwrap());
            if let Err(e) = self.dispatch_setup(&setup) {
                log::warn!("setup request {:#04x} failed: {e}", setup.b_request);
                self.hw.set_stall(0, Direction::In, true);
            }
        }
        if events.contains(Events::COMPLETE) {
            // Completion bits are per-endpoint queue state owned by the
            // controller; draining them is the controller's job via
            // `Transaction::retired`, already invoked from irq context in
            // this model since fsl_usb2 calls it directly off the dTD
            // interrupt. The coalesced-bits field exists so a future
            // controller without direct retirement access has something
            // to drain here.
            self.completions.store(0, Ordering::Release);
        }
    }

    /// Tries the device's/functions' own setup handling first, then
    /// resolves standard requests the device doesn't claim (SPEC_FULL.md
    /// §4.4, "Setup dispatch").
    fn dispatch_setup(&self, setup: &SetupPacket) -> KResult<()> {
        if setup.recipient() != 0x00 && setup.recipient() != RECIPIENT_ENDPOINT {
            // interface / other recipients: give functions first refusal
        }
        if let Some(config_idx) = *self.current_config.lock() {
            if let Some(config) = self.device.configurations.iter().find(|c| c.value == config_idx) {
                for func in &config.functions {
                    if let Some(result) = func.process_setup(setup) {
                        let data = result?;
                        return self.reply_in(&data, setup.w_length);
                    }
                }
            }
        }
        self.dispatch_standard(setup)
    }

    fn dispatch_standard(&self, setup: &SetupPacket) -> KResult<()> {
        match setup.b_request {
            REQ_GET_STATUS => {
                let status: u16 = 0; // self-powered=0, remote-wakeup=0 in this model
                self.reply_in(&status.to_le_bytes(), setup.w_length)
            }
            REQ_CLEAR_FEATURE | REQ_SET_FEATURE if setup.w_value == FEATURE_ENDPOINT_HALT => {
                let ep = (setup.w_index & 0x0f) as u8;
                let dir = if setup.w_index & 0x80 != 0 { Direction::In } else { Direction::Out };
                let stall = setup.b_request == REQ_SET_FEATURE;
                self.hw.set_stall(ep, dir, stall);
                if !stall && ep != 0 {
                    self.hw.reset_data_toggle(ep, dir);
                }
                self.reply_status()
            }
            REQ_SET_ADDRESS => {
                let addr = (setup.w_value & 0x7f) as u8;
                self.address_pending.store(addr, Ordering::Release);
                // Status IN must complete before the hardware address is
                // programmed (SPEC_FULL.md §4.4, §8 "USB setup address").
                let txn = self.ep0_in.clone();
                let udc_for_cb = self.self_ref.lock().clone();
                txn.clear();
                txn.set_buf(Vec::new(), false);
                txn.set_done(move |_status| {
                    let Some(udc) = udc_for_cb.upgrade() else { return };
                    let addr = udc.address_pending.load(Ordering::Acquire);
                    udc.hw.program_address(addr);
                    *udc.state.lock() = DeviceState::Address;
                });
                self.hw.enqueue(0, Direction::In, txn)
            }
            REQ_GET_DESCRIPTOR => self.get_descriptor(setup),
            REQ_SET_CONFIGURATION => {
                let value = (setup.w_value & 0xff) as u8;
                if value == 0 {
                    *self.current_config.lock() = None;
                    *self.state.lock() = DeviceState::Address;
                } else {
                    let config = self
                        .device
                        .configurations
                        .iter()
                        .find(|c| c.value == value)
                        .ok_or_else(|| KernelError::Invalid.context("unknown configuration value"))?;
                    for func in &config.functions {
                        func.start()?;
                    }
                    *self.current_config.lock() = Some(value);
                    *self.state.lock() = DeviceState::Configured;
                }
                self.reply_status()
            }
            _ => Err(KernelError::NotSupported.context("unclaimed standard setup request")),
        }
    }

    fn get_descriptor(&self, setup: &SetupPacket) -> KResult<()> {
        let ty = (setup.w_value >> 8) as u8;
        let index = (setup.w_value & 0xff) as usize;
        let data = match ty {
            t if t == descriptor::DescriptorType::Device as u8 => self.device.descriptor.encode().to_vec(),
            t if t == descriptor::DescriptorType::DeviceQualifier as u8 => self.device.descriptor.qualifier().to_vec(),
            t if t == descriptor::DescriptorType::Configuration as u8 => self.device.encode_configuration(index, false)?,
            t if t == descriptor::DescriptorType::OtherSpeedConfiguration as u8 => {
                self.device.encode_configuration(index, true)?
            }
            t if t == descriptor::DescriptorType::String as u8 => {
                if index == 0 {
                    vec![4, descriptor::DescriptorType::String as u8, 0x09, 0x04] // English (US)
                } else {
                    let s = self.device.strings.get(index - 1).ok_or(KernelError::NotFound)?;
                    descriptor::encode_string(s)
                }
            }
            _ => return Err(KernelError::NotSupported.context("unknown descriptor type")),
        };
        self.reply_in(&data, setup.w_length)
    }

    fn reply_in(&self, data: &[u8], w_length: u16) -> KResult<()> {
        let n = data.len().min(w_length as usize);
        let txn = self.ep0_in.clone();
        txn.clear();
        txn.set_buf(data[..n].to_vec(), n % (self.config.ep0_max_packet) == 0);
        self.hw.enqueue(0, Direction::In, txn)
    }

    fn reply_status(&self) -> KResult<()> {
        let txn = self.ep0_in.clone();
        txn.clear();
        txn.set_buf(Vec::new(), false);
        self.hw.enqueue(0, Direction::In, txn)
    }

    pub fn get_stall(&self, ep: u8, dir: Direction) -> bool {
        self.hw.is_stalled(ep, dir)
    }

    /// Stops the UDC worker thread (SPEC_FULL.md §5, "Cancellation").
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.stop.raise();
        self.worker_wake.post_once();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Udc {
    fn drop(&mut self) {
        self.stop();
    }
}
