//! A multi-channel DMA controller.
//!
//! Channels are programmed through their register bank and moved forward by
//! a background [`Ticker`], `burst` bytes per channel per tick, through a
//! [`DmaBus`]. Explicit `clock(Tick, n)` requests step synchronously, which
//! is what deterministic tests use.

use std::sync::Arc;
use std::time::Duration;

use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use axerrno::{AxResult, ax_err};
use spin::Mutex;

use super::memory::DmaBus;
use crate::device::{DeviceModel, InterruptRaiser};
use crate::protocol::{AccessWidth, ClockAction, ResetAction};
use crate::ticker::Ticker;

/// Register layout.
pub mod regs {
    pub const INT_STATUS: usize = 0x00;
    pub const INT_CLEAR: usize = 0x08;
    pub const GLOBAL_CTRL: usize = 0x30;

    pub const CHANNEL_BASE: usize = 0x100;
    pub const CHANNEL_STRIDE: usize = 0x20;

    pub const CH_CTRL: usize = 0x00;
    pub const CH_STATUS: usize = 0x04;
    pub const CH_SRC: usize = 0x08;
    pub const CH_DST: usize = 0x0C;
    pub const CH_SIZE: usize = 0x10;
    pub const CH_CONFIG: usize = 0x14;
    pub const CH_SRC_HI: usize = 0x18;
    pub const CH_DST_HI: usize = 0x1C;

    pub const CTRL_ENABLE: u32 = 1 << 0;
    pub const STATUS_BUSY: u32 = 1 << 0;
    pub const STATUS_DONE: u32 = 1 << 1;
    pub const STATUS_ERROR: u32 = 1 << 2;
    pub const CONFIG_SRC_INC: u32 = 1 << 0;
    pub const CONFIG_DST_INC: u32 = 1 << 1;
    pub const CONFIG_INT_EN: u32 = 1 << 8;
}

use regs::*;

/// Hard limit on channels per controller; one INT_STATUS bit each.
pub const MAX_CHANNELS: usize = 16;

/// Size of the register window claimed by one controller.
pub const DMA_WINDOW: usize = 0x1000;

#[derive(Debug, Clone)]
pub struct DmaConfig {
    pub name: String,
    pub base: usize,
    pub channels: usize,
    /// Bytes moved per channel per step.
    pub burst: usize,
    /// Channel `n` completes on IRQ `irq_base + n`.
    pub irq_base: u32,
    /// Background step interval.
    pub tick: Duration,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            name: "dma0".into(),
            base: 0x4000_6000,
            channels: 8,
            burst: 512,
            irq_base: 10,
            tick: Duration::from_millis(10),
        }
    }
}

impl DmaConfig {
    pub fn instance(id: usize) -> Self {
        let default = Self::default();
        Self {
            name: format!("dma{id}"),
            base: default.base + id * DMA_WINDOW,
            ..default
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Channel {
    ctrl: u32,
    status: u32,
    src: u64,
    dst: u64,
    size: u32,
    config: u32,
}

impl Channel {
    fn active(&self) -> bool {
        self.ctrl & CTRL_ENABLE != 0
    }

    fn finish(&mut self, status: u32) {
        self.ctrl &= !CTRL_ENABLE;
        self.status = status;
    }
}

#[derive(Debug)]
struct DmaState {
    channels: ArrayVec<Channel, MAX_CHANNELS>,
    int_status: u32,
    global_ctrl: u32,
}

impl DmaState {
    fn new(channels: usize) -> Self {
        let mut state = Self {
            channels: ArrayVec::new(),
            int_status: 0,
            global_ctrl: 0,
        };
        state
            .channels
            .extend(core::iter::repeat_n(Channel::default(), channels.min(MAX_CHANNELS)));
        state
    }
}

struct DmaShared {
    config: DmaConfig,
    state: Mutex<DmaState>,
    bus: Arc<dyn DmaBus>,
    irq: Arc<dyn InterruptRaiser>,
    paused: AtomicBool,
}

impl DmaShared {
    /// Moves one burst on `ch`. Returns the final status if the channel
    /// finished.
    fn transfer(&self, ch: &mut Channel) -> Option<u32> {
        if ch.size == 0 {
            return Some(STATUS_DONE);
        }
        let chunk = (ch.size as usize).min(self.config.burst.max(1));
        let mut buf = vec![0u8; chunk];
        let (src, dst) = (ch.src as usize, ch.dst as usize);

        let read = if ch.config & CONFIG_SRC_INC != 0 {
            self.bus.read(src, &mut buf)
        } else {
            buf.iter_mut()
                .try_for_each(|byte| self.bus.read(src, core::slice::from_mut(byte)))
        };
        let moved = read.and_then(|_| {
            if ch.config & CONFIG_DST_INC != 0 {
                self.bus.write(dst, &buf)
            } else {
                buf.iter()
                    .try_for_each(|byte| self.bus.write(dst, core::slice::from_ref(byte)))
            }
        });
        if let Err(err) = moved {
            warn!(
                "{}: bus error at src {:#x} dst {:#x}: {:?}",
                self.config.name, src, dst, err
            );
            return Some(STATUS_ERROR);
        }

        if ch.config & CONFIG_SRC_INC != 0 {
            ch.src += chunk as u64;
        }
        if ch.config & CONFIG_DST_INC != 0 {
            ch.dst += chunk as u64;
        }
        ch.size -= chunk as u32;
        (ch.size == 0).then_some(STATUS_DONE)
    }

    /// Advances every active channel by one burst and raises the completion
    /// interrupts.
    fn step(&self) {
        let mut completed = ArrayVec::<u32, MAX_CHANNELS>::new();
        {
            let mut state = self.state.lock();
            let DmaState {
                channels,
                int_status,
                ..
            } = &mut *state;
            for (n, ch) in channels.iter_mut().enumerate() {
                if !ch.active() {
                    continue;
                }
                let Some(status) = self.transfer(ch) else {
                    continue;
                };
                ch.finish(status);
                *int_status |= 1 << n;
                debug!(
                    "{}: channel {} {}",
                    self.config.name,
                    n,
                    if status == STATUS_DONE { "done" } else { "failed" }
                );
                if ch.config & CONFIG_INT_EN != 0 {
                    completed.push(self.config.irq_base + n as u32);
                }
            }
        }
        for irq in completed {
            if let Err(err) = self.irq.raise(irq) {
                debug!("{}: IRQ {} not delivered: {:?}", self.config.name, irq, err);
            }
        }
    }
}

enum Register {
    Global(usize),
    Channel(usize, usize),
}

pub struct Dma {
    shared: Arc<DmaShared>,
    worker: Mutex<Option<Ticker>>,
}

impl Dma {
    pub fn new(config: DmaConfig, bus: Arc<dyn DmaBus>, irq: Arc<dyn InterruptRaiser>) -> Self {
        let state = DmaState::new(config.channels);
        Self {
            shared: Arc::new(DmaShared {
                config,
                state: Mutex::new(state),
                bus,
                irq,
                paused: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DmaConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(Ticker::is_running)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    fn start(&self) -> AxResult {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        *worker = Some(Ticker::spawn(
            &self.shared.config.name,
            self.shared.config.tick,
            move |_| {
                if !shared.paused.load(Ordering::Acquire) {
                    shared.step();
                }
            },
        )?);
        Ok(())
    }

    fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    fn decode(&self, addr: usize) -> Option<Register> {
        let off = addr
            .checked_sub(self.shared.config.base)
            .filter(|off| *off < DMA_WINDOW)?;
        if off < CHANNEL_BASE {
            return Some(Register::Global(off));
        }
        let n = (off - CHANNEL_BASE) / CHANNEL_STRIDE;
        let channels = self.shared.config.channels.min(MAX_CHANNELS);
        (n < channels).then(|| Register::Channel(n, (off - CHANNEL_BASE) % CHANNEL_STRIDE))
    }
}

fn lo(v: u64) -> u32 {
    v as u32
}

fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

fn with_lo(v: u64, lo: u32) -> u64 {
    (v & !0xffff_ffff) | u64::from(lo)
}

fn with_hi(v: u64, hi: u32) -> u64 {
    (v & 0xffff_ffff) | (u64::from(hi) << 32)
}

impl DeviceModel for Dma {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn init(&self) -> AxResult {
        let config = &self.shared.config;
        info!(
            "{}: DMA at {:#x}, {} channels, IRQ {}..{}",
            config.name,
            config.base,
            config.channels,
            config.irq_base,
            config.irq_base + config.channels as u32
        );
        self.start()
    }

    fn cleanup(&self) {
        self.stop();
    }

    fn clock(&self, action: ClockAction, cycles: u32) -> AxResult {
        match action {
            ClockAction::Tick => (0..cycles).for_each(|_| self.shared.step()),
            ClockAction::Enable => self.shared.paused.store(false, Ordering::Release),
            ClockAction::Disable => self.shared.paused.store(true, Ordering::Release),
        }
        Ok(())
    }

    fn reset(&self, action: ResetAction) -> AxResult {
        match action {
            ResetAction::Assert => {
                self.stop();
                *self.shared.state.lock() = DmaState::new(self.shared.config.channels);
                debug!("{}: reset asserted", self.shared.config.name);
                Ok(())
            }
            ResetAction::Deassert => self.start(),
        }
    }

    fn register_read(&self, addr: usize, _width: AccessWidth) -> u32 {
        let state = self.shared.state.lock();
        match self.decode(addr) {
            Some(Register::Global(INT_STATUS)) => state.int_status,
            Some(Register::Global(INT_CLEAR)) => 0,
            Some(Register::Global(GLOBAL_CTRL)) => state.global_ctrl,
            Some(Register::Channel(n, reg)) => {
                let ch = &state.channels[n];
                match reg {
                    CH_CTRL => ch.ctrl,
                    CH_STATUS => ch.status,
                    CH_SRC => lo(ch.src),
                    CH_DST => lo(ch.dst),
                    CH_SIZE => ch.size,
                    CH_CONFIG => ch.config,
                    CH_SRC_HI => hi(ch.src),
                    CH_DST_HI => hi(ch.dst),
                    _ => 0,
                }
            }
            _ => {
                warn!(
                    "{}: read of unknown register {:#x}",
                    self.shared.config.name, addr
                );
                0
            }
        }
    }

    fn register_write(&self, addr: usize, _width: AccessWidth, value: u32) -> AxResult {
        let mut state = self.shared.state.lock();
        match self.decode(addr) {
            Some(Register::Global(INT_CLEAR)) => state.int_status &= !value,
            Some(Register::Global(GLOBAL_CTRL)) => state.global_ctrl = value,
            Some(Register::Channel(n, reg)) => {
                let ch = &mut state.channels[n];
                match reg {
                    CH_CTRL => {
                        ch.ctrl = value;
                        if value & CTRL_ENABLE != 0 {
                            ch.status = STATUS_BUSY;
                            debug!(
                                "{}: channel {} started, {} bytes {:#x} -> {:#x}",
                                self.shared.config.name, n, ch.size, ch.src, ch.dst
                            );
                        } else {
                            ch.status &= !STATUS_BUSY;
                        }
                    }
                    CH_STATUS => ch.status &= !(value & (STATUS_DONE | STATUS_ERROR)),
                    CH_SRC => ch.src = with_lo(ch.src, value),
                    CH_DST => ch.dst = with_lo(ch.dst, value),
                    CH_SIZE => ch.size = value,
                    CH_CONFIG => ch.config = value,
                    CH_SRC_HI => ch.src = with_hi(ch.src, value),
                    CH_DST_HI => ch.dst = with_hi(ch.dst, value),
                    _ => return ax_err!(NotFound, "write to unknown DMA channel register"),
                }
            }
            _ => return ax_err!(NotFound, "write to unknown DMA register"),
        }
        Ok(())
    }

    fn interrupt(&self, irq: u32) -> AxResult {
        let base = self.shared.config.irq_base;
        let channels = self.shared.config.channels.min(MAX_CHANNELS) as u32;
        if !(base..base + channels).contains(&irq) {
            return ax_err!(NotFound, "not a DMA interrupt line");
        }
        self.shared.state.lock().int_status &= !(1 << (irq - base));
        Ok(())
    }
}

impl Drop for Dma {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::memory::SparseMemory;
    use crate::models::tests::RecordingRaiser;
    use axerrno::AxError;

    const BASE: usize = 0x4000_6000;

    struct Bench {
        dma: Dma,
        mem: Arc<SparseMemory>,
        raiser: Arc<RecordingRaiser>,
    }

    fn bench() -> Bench {
        let mem = Arc::new(SparseMemory::new());
        mem.add_region(0x1000, 0x1000).unwrap();
        mem.add_region(0x8000, 0x1000).unwrap();
        let raiser = Arc::new(RecordingRaiser::default());
        let config = DmaConfig {
            burst: 16,
            tick: Duration::from_secs(3600),
            ..DmaConfig::default()
        };
        let dma = Dma::new(config, mem.clone(), raiser.clone());
        Bench { dma, mem, raiser }
    }

    fn ch(n: usize, reg: usize) -> usize {
        BASE + CHANNEL_BASE + n * CHANNEL_STRIDE + reg
    }

    impl Bench {
        fn write(&self, addr: usize, value: u32) {
            self.dma
                .register_write(addr, AccessWidth::Dword, value)
                .unwrap();
        }

        fn read(&self, addr: usize) -> u32 {
            self.dma.register_read(addr, AccessWidth::Dword)
        }

        fn program(&self, n: usize, src: usize, dst: usize, size: u32, config: u32) {
            self.write(ch(n, CH_SRC), src as u32);
            self.write(ch(n, CH_DST), dst as u32);
            self.write(ch(n, CH_SIZE), size);
            self.write(ch(n, CH_CONFIG), config);
            self.write(ch(n, CH_CTRL), CTRL_ENABLE);
        }
    }

    #[test]
    fn test_memory_to_memory_transfer() {
        let b = bench();
        let data: Vec<u8> = (0..40).collect();
        b.mem.load(0x1000, &data).unwrap();
        b.program(2, 0x1000, 0x8000, 40, CONFIG_SRC_INC | CONFIG_DST_INC | CONFIG_INT_EN);
        assert_eq!(b.read(ch(2, CH_STATUS)), STATUS_BUSY);

        b.dma.clock(ClockAction::Tick, 2).unwrap();
        assert_eq!(b.read(ch(2, CH_SIZE)), 8);
        assert_eq!(b.read(ch(2, CH_SRC)), 0x1020);
        assert!(b.raiser.raised().is_empty());

        b.dma.clock(ClockAction::Tick, 1).unwrap();
        assert_eq!(b.mem.dump(0x8000, 40).unwrap(), data);
        assert_eq!(b.read(ch(2, CH_STATUS)), STATUS_DONE);
        assert_eq!(b.read(ch(2, CH_CTRL)) & CTRL_ENABLE, 0);
        assert_eq!(b.read(BASE + INT_STATUS), 1 << 2);
        assert_eq!(b.raiser.raised(), vec![12]);

        // Finished channels stay quiet.
        b.dma.clock(ClockAction::Tick, 3).unwrap();
        assert_eq!(b.raiser.count(12), 1);

        b.write(ch(2, CH_STATUS), STATUS_DONE);
        assert_eq!(b.read(ch(2, CH_STATUS)), 0);
        b.write(BASE + INT_CLEAR, 1 << 2);
        assert_eq!(b.read(BASE + INT_STATUS), 0);
    }

    #[test]
    fn test_fixed_destination_sees_every_byte() {
        let b = bench();
        b.mem.load(0x1000, b"abc").unwrap();
        b.program(0, 0x1000, 0x8000, 3, CONFIG_SRC_INC);
        b.dma.clock(ClockAction::Tick, 1).unwrap();
        assert_eq!(b.mem.dump(0x8000, 2).unwrap(), b"c\0");
        assert_eq!(b.read(ch(0, CH_STATUS)), STATUS_DONE);
        // No INT_EN, no interrupt; status bit still latched.
        assert!(b.raiser.raised().is_empty());
        assert_eq!(b.read(BASE + INT_STATUS), 1);
    }

    #[test]
    fn test_bus_error_stops_channel() {
        let b = bench();
        b.program(1, 0x5000, 0x8000, 8, CONFIG_SRC_INC | CONFIG_DST_INC | CONFIG_INT_EN);
        b.dma.clock(ClockAction::Tick, 1).unwrap();
        assert_eq!(b.read(ch(1, CH_STATUS)), STATUS_ERROR);
        assert_eq!(b.read(ch(1, CH_CTRL)), 0);
        assert_eq!(b.raiser.raised(), vec![11]);
        assert_eq!(b.read(ch(1, CH_SIZE)), 8);
    }

    #[test]
    fn test_high_address_halves() {
        let b = bench();
        b.write(ch(3, CH_SRC), 0x89ab_cdef);
        b.write(ch(3, CH_SRC_HI), 0x7f);
        assert_eq!(b.read(ch(3, CH_SRC)), 0x89ab_cdef);
        assert_eq!(b.read(ch(3, CH_SRC_HI)), 0x7f);
        b.write(ch(3, CH_DST_HI), 1);
        assert_eq!(b.read(ch(3, CH_DST)), 0);
        assert_eq!(b.read(ch(3, CH_DST_HI)), 1);
    }

    #[test]
    fn test_register_window() {
        let b = bench();
        b.write(BASE + GLOBAL_CTRL, 1);
        assert_eq!(b.read(BASE + GLOBAL_CTRL), 1);
        assert_eq!(
            b.dma.register_write(ch(8, CH_CTRL), AccessWidth::Dword, 1),
            Err(AxError::NotFound)
        );
        assert_eq!(
            b.dma.register_write(BASE + 0x40, AccessWidth::Dword, 1),
            Err(AxError::NotFound)
        );
        assert_eq!(b.read(ch(8, CH_CTRL)), 0);
        assert_eq!(b.read(BASE + DMA_WINDOW), 0);
    }

    #[test]
    fn test_interrupt_ack() {
        let b = bench();
        b.program(4, 0x1000, 0x8000, 0, CONFIG_INT_EN);
        b.dma.clock(ClockAction::Tick, 1).unwrap();
        assert_eq!(b.read(BASE + INT_STATUS), 1 << 4);
        b.dma.interrupt(14).unwrap();
        assert_eq!(b.read(BASE + INT_STATUS), 0);
        assert_eq!(b.dma.interrupt(18), Err(AxError::NotFound));
        assert_eq!(b.dma.interrupt(9), Err(AxError::NotFound));
    }

    #[test]
    fn test_lifecycle_controls() {
        let b = bench();
        b.dma.init().unwrap();
        assert!(b.dma.is_running());

        b.dma.clock(ClockAction::Disable, 0).unwrap();
        assert!(b.dma.is_paused());
        b.dma.clock(ClockAction::Enable, 0).unwrap();
        assert!(!b.dma.is_paused());

        b.program(0, 0x1000, 0x8000, 4, CONFIG_SRC_INC | CONFIG_DST_INC);
        b.dma.reset(ResetAction::Assert).unwrap();
        assert!(!b.dma.is_running());
        assert_eq!(b.read(ch(0, CH_CTRL)), 0);
        assert_eq!(b.read(ch(0, CH_SIZE)), 0);

        b.dma.reset(ResetAction::Deassert).unwrap();
        assert!(b.dma.is_running());
        b.dma.cleanup();
        assert!(!b.dma.is_running());
    }

    #[test]
    fn test_background_stepping() {
        let mem = Arc::new(SparseMemory::new());
        mem.add_region(0x1000, 0x100).unwrap();
        mem.add_region(0x2000, 0x100).unwrap();
        mem.load(0x1000, &[7; 64]).unwrap();
        let raiser = Arc::new(RecordingRaiser::default());
        let config = DmaConfig {
            tick: Duration::from_millis(1),
            ..DmaConfig::default()
        };
        let dma = Dma::new(config, mem.clone(), raiser.clone());
        dma.init().unwrap();
        for (reg, value) in [
            (CH_SRC, 0x1000),
            (CH_DST, 0x2000),
            (CH_SIZE, 64),
            (CH_CONFIG, CONFIG_SRC_INC | CONFIG_DST_INC | CONFIG_INT_EN),
            (CH_CTRL, CTRL_ENABLE),
        ] {
            dma.register_write(ch(0, reg), AccessWidth::Dword, value)
                .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while raiser.count(10) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(raiser.count(10), 1);
        assert_eq!(mem.dump(0x2000, 64).unwrap(), vec![7; 64]);
        dma.cleanup();
    }
}
