//! A PL011-style UART.
//!
//! Transmitted bytes go to an in-memory log. While the UART is enabled a
//! background [`Ticker`] feeds the receive FIFO with `A..=Z` whenever it runs
//! empty, so drivers see receive interrupts without a host peer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axerrno::{AxResult, ax_err};
use spin::Mutex;

use crate::device::{DeviceModel, InterruptRaiser};
use crate::protocol::{AccessWidth, ClockAction, ResetAction};
use crate::ticker::Ticker;

/// Register offsets from the UART base.
pub mod regs {
    pub const DR: usize = 0x00;
    pub const RSR: usize = 0x04;
    pub const FR_ALIAS: usize = 0x08;
    pub const CR_ALIAS: usize = 0x0C;
    pub const DMACR_ALIAS: usize = 0x10;
    pub const FR: usize = 0x18;
    pub const ILPR: usize = 0x20;
    pub const IBRD: usize = 0x24;
    pub const FBRD: usize = 0x28;
    pub const LCR_H: usize = 0x2C;
    pub const CR: usize = 0x30;
    pub const IFLS: usize = 0x34;
    pub const IMSC: usize = 0x38;
    pub const RIS: usize = 0x3C;
    pub const MIS: usize = 0x40;
    pub const ICR: usize = 0x44;
    pub const DMACR: usize = 0x48;

    pub const FR_RXFE: u32 = 1 << 4;
    pub const FR_TXFE: u32 = 1 << 7;
    pub const CR_UARTEN: u32 = 1 << 0;
    pub const INT_RX: u32 = 1 << 4;
    pub const INT_TX: u32 = 1 << 5;

    pub const IBRD_RESET: u32 = 0x6E;
    pub const LCR_H_RESET: u32 = 0x70;
}

use regs::*;

const RX_FIFO_DEPTH: usize = 256;

/// Size of the register window claimed by one UART.
pub const UART_WINDOW: usize = 0x1000;

#[derive(Debug, Clone)]
pub struct UartConfig {
    pub name: String,
    pub base: usize,
    pub tx_irq: u32,
    pub rx_irq: u32,
    /// Receive simulation tick.
    pub tick: Duration,
    /// Ticks between simulated receive bytes.
    pub rx_period: u64,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            name: "uart0".into(),
            base: 0x4000_1000,
            tx_irq: 5,
            rx_irq: 6,
            tick: Duration::from_millis(100),
            rx_period: 50,
        }
    }
}

impl UartConfig {
    /// Instance `id`: named `uart<id>`, based `id` windows above instance 0.
    pub fn instance(id: usize) -> Self {
        let default = Self::default();
        Self {
            name: format!("uart{id}"),
            base: default.base + id * UART_WINDOW,
            ..default
        }
    }
}

#[derive(Debug)]
struct UartRegs {
    rsr: u32,
    ilpr: u32,
    ibrd: u32,
    fbrd: u32,
    lcr_h: u32,
    cr: u32,
    ifls: u32,
    imsc: u32,
    ris: u32,
    dmacr: u32,
    rx_fifo: VecDeque<u8>,
    next_letter: u8,
}

impl UartRegs {
    fn new() -> Self {
        Self {
            rsr: 0,
            ilpr: 0,
            ibrd: IBRD_RESET,
            fbrd: 0,
            lcr_h: LCR_H_RESET,
            cr: 0,
            ifls: 0,
            imsc: 0,
            ris: 0,
            dmacr: 0,
            rx_fifo: VecDeque::with_capacity(RX_FIFO_DEPTH),
            next_letter: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.cr & CR_UARTEN != 0
    }

    fn flags(&self) -> u32 {
        let mut fr = FR_TXFE;
        if self.rx_fifo.is_empty() {
            fr |= FR_RXFE;
        }
        fr
    }

    /// Pushes received bytes; returns how many fit.
    fn receive(&mut self, bytes: &[u8]) -> usize {
        let room = RX_FIFO_DEPTH - self.rx_fifo.len();
        let taken = bytes.len().min(room);
        self.rx_fifo.extend(&bytes[..taken]);
        if taken > 0 {
            self.ris |= INT_RX;
        }
        taken
    }
}

struct UartShared {
    config: UartConfig,
    regs: Mutex<UartRegs>,
    tx_log: Mutex<Vec<u8>>,
    irq: Arc<dyn InterruptRaiser>,
}

impl UartShared {
    fn raise(&self, irq: u32) {
        if let Err(err) = self.irq.raise(irq) {
            debug!("{}: IRQ {} not delivered: {:?}", self.config.name, irq, err);
        }
    }

    fn rx_tick(&self, tick: u64) {
        if tick % self.config.rx_period.max(1) != 0 {
            return;
        }
        let injected = {
            let mut regs = self.regs.lock();
            if !regs.enabled() || !regs.rx_fifo.is_empty() {
                return;
            }
            let byte = b'A' + regs.next_letter;
            regs.next_letter = (regs.next_letter + 1) % 26;
            regs.receive(&[byte]);
            byte
        };
        trace!("{}: received {:?}", self.config.name, injected as char);
        self.raise(self.config.rx_irq);
    }
}

pub struct Uart {
    shared: Arc<UartShared>,
    rx_worker: Mutex<Option<Ticker>>,
}

impl Uart {
    pub fn new(config: UartConfig, irq: Arc<dyn InterruptRaiser>) -> Self {
        Self {
            shared: Arc::new(UartShared {
                config,
                regs: Mutex::new(UartRegs::new()),
                tx_log: Mutex::new(Vec::new()),
                irq,
            }),
            rx_worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UartConfig {
        &self.shared.config
    }

    /// Everything transmitted through DR so far.
    pub fn tx_log(&self) -> Vec<u8> {
        self.shared.tx_log.lock().clone()
    }

    /// Feeds `bytes` into the receive FIFO as if they arrived on the line,
    /// raising the receive IRQ when the UART is enabled. Bytes beyond the
    /// FIFO depth are lost.
    pub fn inject_rx(&self, bytes: &[u8]) -> AxResult<usize> {
        let (taken, enabled) = {
            let mut regs = self.shared.regs.lock();
            (regs.receive(bytes), regs.enabled())
        };
        if taken < bytes.len() {
            warn!(
                "{}: RX overrun, {} bytes lost",
                self.shared.config.name,
                bytes.len() - taken
            );
        }
        if taken > 0 && enabled {
            self.shared.irq.raise(self.shared.config.rx_irq)?;
        }
        Ok(taken)
    }

    /// Whether the receive simulation thread is running.
    pub fn rx_running(&self) -> bool {
        self.rx_worker.lock().as_ref().is_some_and(Ticker::is_running)
    }

    fn start_rx(&self) -> AxResult {
        let mut worker = self.rx_worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let name = format!("{}-rx", self.shared.config.name);
        *worker = Some(Ticker::spawn(&name, self.shared.config.tick, move |n| {
            shared.rx_tick(n)
        })?);
        Ok(())
    }

    fn stop_rx(&self) {
        let worker = self.rx_worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    fn offset(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.shared.config.base)
            .filter(|off| *off < UART_WINDOW)
            .map(|off| match off {
                FR_ALIAS => FR,
                CR_ALIAS => CR,
                DMACR_ALIAS => DMACR,
                off => off,
            })
    }
}

impl DeviceModel for Uart {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn init(&self) -> AxResult {
        info!(
            "{}: UART at {:#x}, TX IRQ {}, RX IRQ {}",
            self.shared.config.name,
            self.shared.config.base,
            self.shared.config.tx_irq,
            self.shared.config.rx_irq
        );
        Ok(())
    }

    fn cleanup(&self) {
        self.stop_rx();
    }

    fn clock(&self, action: ClockAction, cycles: u32) -> AxResult {
        trace!("{}: clock {:?} x{}", self.shared.config.name, action, cycles);
        Ok(())
    }

    fn reset(&self, action: ResetAction) -> AxResult {
        if action == ResetAction::Assert {
            self.stop_rx();
            *self.shared.regs.lock() = UartRegs::new();
            debug!("{}: reset", self.shared.config.name);
        }
        Ok(())
    }

    fn register_read(&self, addr: usize, _width: AccessWidth) -> u32 {
        let mut regs = self.shared.regs.lock();
        match self.offset(addr) {
            Some(DR) => {
                let byte = regs.rx_fifo.pop_front().unwrap_or(0);
                if regs.rx_fifo.is_empty() {
                    regs.ris &= !INT_RX;
                }
                byte.into()
            }
            Some(RSR) => regs.rsr,
            Some(FR) => regs.flags(),
            Some(ILPR) => regs.ilpr,
            Some(IBRD) => regs.ibrd,
            Some(FBRD) => regs.fbrd,
            Some(LCR_H) => regs.lcr_h,
            Some(CR) => regs.cr,
            Some(IFLS) => regs.ifls,
            Some(IMSC) => regs.imsc,
            Some(RIS) => regs.ris,
            Some(MIS) => regs.ris & regs.imsc,
            Some(DMACR) => regs.dmacr,
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
        let config = &self.shared.config;
        let mut regs = self.shared.regs.lock();
        match self.offset(addr) {
            Some(DR) => {
                let byte = value as u8;
                self.shared.tx_log.lock().push(byte);
                regs.ris |= INT_TX;
                let enabled = regs.enabled();
                drop(regs);
                trace!("{}: transmit {:#04x}", config.name, byte);
                if enabled {
                    self.shared.raise(config.tx_irq);
                }
            }
            Some(RSR) => regs.rsr = 0,
            // Flags are derived from the FIFO state.
            Some(FR) => debug!("{}: write to read-only FR ignored", config.name),
            Some(ILPR) => regs.ilpr = value,
            Some(IBRD) => regs.ibrd = value,
            Some(FBRD) => regs.fbrd = value,
            Some(LCR_H) => regs.lcr_h = value,
            Some(CR) => {
                let was = regs.enabled();
                regs.cr = value;
                let now = regs.enabled();
                drop(regs);
                match (was, now) {
                    (false, true) => {
                        debug!("{}: enabled", config.name);
                        self.start_rx()?;
                    }
                    (true, false) => {
                        debug!("{}: disabled", config.name);
                        self.stop_rx();
                    }
                    _ => {}
                }
            }
            Some(IFLS) => regs.ifls = value,
            Some(IMSC) => regs.imsc = value,
            Some(ICR) => regs.ris &= !value,
            Some(DMACR) => regs.dmacr = value,
            _ => {
                return ax_err!(NotFound, "write to unknown UART register");
            }
        }
        Ok(())
    }

    fn interrupt(&self, irq: u32) -> AxResult {
        let config = &self.shared.config;
        let mut regs = self.shared.regs.lock();
        if irq == config.tx_irq {
            regs.ris &= !INT_TX;
        } else if irq == config.rx_irq {
            regs.ris &= !INT_RX;
        } else {
            return ax_err!(NotFound, "not a UART interrupt line");
        }
        Ok(())
    }
}

impl Drop for Uart {
    fn drop(&mut self) {
        self.stop_rx();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::RecordingRaiser;
    use axerrno::AxError;
    use std::time::Instant;

    const BASE: usize = 0x4000_1000;

    fn uart() -> (Uart, Arc<RecordingRaiser>) {
        let raiser = Arc::new(RecordingRaiser::default());
        let config = UartConfig {
            tick: Duration::from_millis(1),
            rx_period: 2,
            ..UartConfig::default()
        };
        (Uart::new(config, raiser.clone()), raiser)
    }

    fn read(uart: &Uart, off: usize) -> u32 {
        uart.register_read(BASE + off, AccessWidth::Dword)
    }

    fn write(uart: &Uart, off: usize, value: u32) -> AxResult {
        uart.register_write(BASE + off, AccessWidth::Dword, value)
    }

    #[test]
    fn test_reset_values() {
        let (uart, _) = uart();
        assert_eq!(read(&uart, IBRD), IBRD_RESET);
        assert_eq!(read(&uart, LCR_H), LCR_H_RESET);
        assert_eq!(read(&uart, CR), 0);
        assert_eq!(read(&uart, FR), FR_TXFE | FR_RXFE);
        assert_eq!(read(&uart, FR_ALIAS), FR_TXFE | FR_RXFE);
    }

    #[test]
    fn test_config_registers_read_back() {
        let (uart, _) = uart();
        for (off, value) in [(ILPR, 3), (IBRD, 1), (FBRD, 0x21), (LCR_H, 0x60), (IFLS, 2), (IMSC, 0x30), (DMACR, 1)] {
            write(&uart, off, value).unwrap();
            assert_eq!(read(&uart, off), value, "offset {off:#x}");
        }
        // Aliases hit the same registers.
        write(&uart, DMACR_ALIAS, 3).unwrap();
        assert_eq!(read(&uart, DMACR), 3);
    }

    #[test]
    fn test_transmit_raises_once_when_enabled() {
        let (uart, raiser) = uart();
        write(&uart, DR, 0x40).unwrap();
        assert!(raiser.raised().is_empty());

        write(&uart, CR_ALIAS, CR_UARTEN).unwrap();
        write(&uart, DR, 0x141).unwrap();
        assert_eq!(uart.tx_log(), vec![0x40, 0x41]);
        assert_eq!(raiser.count(5), 1);
        assert_ne!(read(&uart, RIS) & INT_TX, 0);

        write(&uart, IMSC, INT_TX).unwrap();
        assert_eq!(read(&uart, MIS), INT_TX);
        write(&uart, ICR, INT_TX).unwrap();
        assert_eq!(read(&uart, RIS) & INT_TX, 0);
        write(&uart, CR, 0).unwrap();
    }

    #[test]
    fn test_flag_register_writes_are_ignored() {
        let (uart, _) = uart();
        let flags = read(&uart, FR);
        assert_eq!(write(&uart, FR, 0), Ok(()));
        assert_eq!(write(&uart, FR_ALIAS, 0xffff), Ok(()));
        assert_eq!(read(&uart, FR), flags);
        assert_eq!(read(&uart, FR_ALIAS), flags);
    }

    #[test]
    fn test_unknown_registers() {
        let (uart, _) = uart();
        assert_eq!(write(&uart, 0x4c, 1), Err(AxError::NotFound));
        assert_eq!(read(&uart, 0x4c), 0);
        assert_eq!(
            uart.register_write(BASE - 4, AccessWidth::Dword, 1),
            Err(AxError::NotFound)
        );
        assert_eq!(write(&uart, MIS, 1), Err(AxError::NotFound));
    }

    #[test]
    fn test_injected_bytes_are_read_in_order() {
        let (uart, raiser) = uart();
        assert_eq!(uart.inject_rx(b"hi").unwrap(), 2);
        // Disabled: no interrupt.
        assert!(raiser.raised().is_empty());
        assert_eq!(read(&uart, FR) & FR_RXFE, 0);
        assert_ne!(read(&uart, RIS) & INT_RX, 0);
        assert_eq!(read(&uart, DR), b'h' as u32);
        assert_eq!(read(&uart, DR), b'i' as u32);
        assert_eq!(read(&uart, RIS) & INT_RX, 0);
        assert_ne!(read(&uart, FR) & FR_RXFE, 0);
        assert_eq!(read(&uart, DR), 0);
    }

    #[test]
    fn test_rx_simulation_follows_uarten() {
        let (uart, raiser) = uart();
        write(&uart, CR, CR_UARTEN).unwrap();
        assert!(uart.rx_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.len() < 3 && Instant::now() < deadline {
            if read(&uart, FR) & FR_RXFE == 0 {
                received.push(read(&uart, DR) as u8);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(received, b"ABC");
        assert!(raiser.count(6) >= 2);

        write(&uart, CR, 0).unwrap();
        assert!(!uart.rx_running());
    }

    #[test]
    fn test_interrupt_ack_and_reset() {
        let (uart, _) = uart();
        write(&uart, CR, CR_UARTEN).unwrap();
        write(&uart, DR, b'x' as u32).unwrap();
        uart.interrupt(5).unwrap();
        assert_eq!(read(&uart, RIS) & INT_TX, 0);
        assert_eq!(uart.interrupt(9), Err(AxError::NotFound));

        write(&uart, IBRD, 1).unwrap();
        uart.reset(ResetAction::Assert).unwrap();
        assert!(!uart.rx_running());
        assert_eq!(read(&uart, IBRD), IBRD_RESET);
        assert_eq!(read(&uart, CR), 0);
    }

    #[test]
    fn test_instances_are_spaced_one_window_apart() {
        let uart2 = UartConfig::instance(2);
        assert_eq!(uart2.name, "uart2");
        assert_eq!(uart2.base, 0x4000_3000);
        assert_eq!(uart2.tx_irq, 5);
    }
}
