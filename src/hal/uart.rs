//! Serial transport
//!
//! [`Transport`] is what the runloop needs from the console line: a way to
//! have a received byte raise a flag from interrupt context, and a blocking
//! flush through `embedded_hal::serial::Write`. USART0 implements it on the
//! target; the ring buffer and trigger table are target independent.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::serial;

// Buffer size must be power of 2 for efficient masking
const BUFFER_SIZE: usize = 32;
const BUFFER_MASK: usize = BUFFER_SIZE - 1;

/// Byte triggers a transport can hold at once
pub const MAX_TRIGGERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartError {
    /// A received byte was dropped because the buffer was full
    Overrun,
    /// Every trigger slot is in use
    TriggersFull,
    /// No trigger is registered for the byte
    NoSuchTrigger,
}

/// How a byte trigger interacts with normal reception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TriggerFlags {
    /// Still append the byte to the receive queue
    pub enqueue: bool,
    /// Fire even while a reader is blocked waiting for input
    pub during_wait: bool,
}

/// A serial line whose received bytes can raise flags
pub trait Transport<'a>: serial::Write<u8> {
    fn is_initialized(&self) -> bool;

    /// Set `signal` whenever `byte` is received.
    fn register_trigger(
        &mut self,
        byte: u8,
        flags: TriggerFlags,
        signal: &'a AtomicBool,
    ) -> Result<(), Self::Error>;

    fn unregister_trigger(&mut self, byte: u8) -> Result<(), Self::Error>;
}

pub struct Buffer {
    data: [u8; BUFFER_SIZE],
    write_idx: usize,
    read_idx: usize,
}

impl Buffer {
    pub const fn new() -> Self {
        Self {
            data: [0; BUFFER_SIZE],
            write_idx: 0,
            read_idx: 0,
        }
    }

    pub fn write(&mut self, byte: u8) -> bool {
        let next_write = (self.write_idx + 1) & BUFFER_MASK;
        if next_write != self.read_idx {
            self.data[self.write_idx] = byte;
            self.write_idx = next_write;
            true
        } else {
            false
        }
    }

    pub fn read(&mut self) -> Option<u8> {
        if self.read_idx != self.write_idx {
            let byte = self.data[self.read_idx];
            self.read_idx = (self.read_idx + 1) & BUFFER_MASK;
            Some(byte)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx == self.write_idx
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct Trigger<'a> {
    byte: u8,
    flags: TriggerFlags,
    signal: &'a AtomicBool,
}

/// Fixed set of byte triggers consulted by the receive interrupt
pub struct TriggerTable<'a> {
    triggers: [Option<Trigger<'a>>; MAX_TRIGGERS],
}

impl<'a> TriggerTable<'a> {
    pub const fn new() -> Self {
        Self {
            triggers: [None; MAX_TRIGGERS],
        }
    }

    /// Register `signal` for `byte`, replacing an existing trigger for it.
    pub fn register(
        &mut self,
        byte: u8,
        flags: TriggerFlags,
        signal: &'a AtomicBool,
    ) -> Result<(), UartError> {
        let trigger = Trigger {
            byte,
            flags,
            signal,
        };
        if let Some(slot) = self
            .triggers
            .iter_mut()
            .flatten()
            .find(|t| t.byte == byte)
        {
            *slot = trigger;
            return Ok(());
        }
        let slot = self
            .triggers
            .iter_mut()
            .find(|t| t.is_none())
            .ok_or(UartError::TriggersFull)?;
        *slot = Some(trigger);
        Ok(())
    }

    pub fn unregister(&mut self, byte: u8) -> Result<(), UartError> {
        let slot = self
            .triggers
            .iter_mut()
            .find(|t| t.map_or(false, |t| t.byte == byte))
            .ok_or(UartError::NoSuchTrigger)?;
        *slot = None;
        Ok(())
    }

    /// Run the trigger for a received byte. Returns whether the byte
    /// belongs in the receive queue.
    pub fn on_receive(&self, byte: u8, reader_waiting: bool) -> bool {
        match self.triggers.iter().flatten().find(|t| t.byte == byte) {
            Some(trigger) => {
                if !reader_waiting || trigger.flags.during_wait {
                    trigger.signal.store(true, Ordering::Release);
                }
                trigger.flags.enqueue
            }
            None => true,
        }
    }
}

impl Default for TriggerTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "avr")]
pub use avr::Uart;

#[cfg(target_arch = "avr")]
mod avr {
    use super::*;
    use crate::config::{CPU_FREQ_HZ, UART_BAUD};
    use avr_device::atmega128a::USART0;
    use core::cell::RefCell;
    use critical_section::Mutex;

    const RXCIE: u8 = 1 << 7;
    const UDRIE: u8 = 1 << 5;
    const RXEN: u8 = 1 << 4;
    const TXEN: u8 = 1 << 3;
    const TXC: u8 = 1 << 6;

    const UBRR: u16 = (CPU_FREQ_HZ / (16 * UART_BAUD) - 1) as u16;

    // Global buffers for interrupt handlers
    static TX_BUFFER: Mutex<RefCell<Buffer>> = Mutex::new(RefCell::new(Buffer::new()));
    static RX_BUFFER: Mutex<RefCell<Buffer>> = Mutex::new(RefCell::new(Buffer::new()));
    static TRIGGERS: Mutex<RefCell<TriggerTable<'static>>> =
        Mutex::new(RefCell::new(TriggerTable::new()));
    static READER_WAITING: AtomicBool = AtomicBool::new(false);
    static OVERRUN: AtomicBool = AtomicBool::new(false);

    /// USART0 at `UART_BAUD`, interrupt driven in both directions
    pub struct Uart {
        usart: USART0,
    }

    impl Uart {
        pub fn new(usart: USART0) -> Self {
            let [lo, hi] = UBRR.to_le_bytes();
            unsafe {
                usart.ubrr0h.write(|w| w.bits(hi));
                usart.ubrr0l.write(|w| w.bits(lo));
                usart.ucsr0b.write(|w| w.bits(RXEN | TXEN | RXCIE));
            }
            Self { usart }
        }
    }

    impl serial::Read<u8> for Uart {
        type Error = UartError;

        fn read(&mut self) -> nb::Result<u8, UartError> {
            if OVERRUN.swap(false, Ordering::Relaxed) {
                return Err(nb::Error::Other(UartError::Overrun));
            }
            match critical_section::with(|cs| RX_BUFFER.borrow_ref_mut(cs).read()) {
                Some(byte) => {
                    READER_WAITING.store(false, Ordering::Relaxed);
                    Ok(byte)
                }
                None => {
                    READER_WAITING.store(true, Ordering::Relaxed);
                    Err(nb::Error::WouldBlock)
                }
            }
        }
    }

    impl serial::Write<u8> for Uart {
        type Error = UartError;

        fn write(&mut self, byte: u8) -> nb::Result<(), UartError> {
            critical_section::with(|cs| {
                if TX_BUFFER.borrow_ref_mut(cs).write(byte) {
                    self.usart
                        .ucsr0b
                        .modify(|r, w| unsafe { w.bits(r.bits() | UDRIE) });
                    Ok(())
                } else {
                    Err(nb::Error::WouldBlock)
                }
            })
        }

        fn flush(&mut self) -> nb::Result<(), UartError> {
            let drained = critical_section::with(|cs| TX_BUFFER.borrow_ref(cs).is_empty());
            let sending = self.usart.ucsr0b.read().bits() & UDRIE != 0;
            let shifted = self.usart.ucsr0a.read().bits() & TXC != 0;
            if drained && !sending && shifted {
                Ok(())
            } else {
                Err(nb::Error::WouldBlock)
            }
        }
    }

    impl Transport<'static> for Uart {
        fn is_initialized(&self) -> bool {
            self.usart.ucsr0b.read().bits() & (RXEN | TXEN) == RXEN | TXEN
        }

        fn register_trigger(
            &mut self,
            byte: u8,
            flags: TriggerFlags,
            signal: &'static AtomicBool,
        ) -> Result<(), UartError> {
            critical_section::with(|cs| TRIGGERS.borrow_ref_mut(cs).register(byte, flags, signal))
        }

        fn unregister_trigger(&mut self, byte: u8) -> Result<(), UartError> {
            critical_section::with(|cs| TRIGGERS.borrow_ref_mut(cs).unregister(byte))
        }
    }

    #[avr_device::interrupt(atmega128a)]
    fn USART0_RX() {
        let usart = unsafe { &*USART0::ptr() };
        let byte = usart.udr0.read().bits();
        critical_section::with(|cs| {
            let waiting = READER_WAITING.load(Ordering::Relaxed);
            if TRIGGERS.borrow_ref(cs).on_receive(byte, waiting)
                && !RX_BUFFER.borrow_ref_mut(cs).write(byte)
            {
                OVERRUN.store(true, Ordering::Relaxed);
            }
        });
    }

    #[avr_device::interrupt(atmega128a)]
    fn USART0_UDRE() {
        let usart = unsafe { &*USART0::ptr() };
        critical_section::with(|cs| match TX_BUFFER.borrow_ref_mut(cs).read() {
            Some(byte) => unsafe {
                // Writing one to TXC clears it, so flush can wait for the
                // last frame to leave the shift register
                usart.ucsr0a.modify(|r, w| w.bits(r.bits() | TXC));
                usart.udr0.write(|w| w.bits(byte));
            },
            None => usart
                .ucsr0b
                .modify(|r, w| unsafe { w.bits(r.bits() & !UDRIE) }),
        });
    }
}
