//! Configuration constants for the ATmega128 runloop

use crate::hal::timer::Prescaler;
use crate::hal::watchdog::WatchdogTimeout;

/// CPU frequency in Hz, as set by the build script
pub const CPU_FREQ_HZ: u32 = parse_hz(env!("MCU_FREQ_HZ"));

/// CPU cycles per millisecond
pub const CYCLES_PER_MS: u32 = CPU_FREQ_HZ / 1000;

/// UART baud rate
pub const UART_BAUD: u32 = 9600;

/// Watchdog timeout while the runloop is active
pub const WDT_TIMEOUT: WatchdogTimeout = WatchdogTimeout::Ms2000;

/// Longest the runloop sleeps without feeding the watchdog, half its timeout
pub const MAX_SLEEP_CYCLES: u32 = WDT_TIMEOUT.millis() / 2 * CYCLES_PER_MS;

/// Number of task slots in the default task table
pub const MAX_TASKS: usize = 8;

/// Countdown accepts its timing once fewer cycles than this remain.
/// Roughly the cost of servicing one timer interrupt.
pub const COUNTDOWN_IMPRECISION_CYCLES: u32 = 64;

/// Byte on the console transport that hands control to the console (ESC)
pub const CONSOLE_ESCAPE_BYTE: u8 = 0x1B;

/// Prescaler used while the timer free-runs as a stopwatch
pub const DEFAULT_PRESCALER: Prescaler = Prescaler::Div64;

/// Convert milliseconds to CPU cycles, `None` if the result does not fit.
pub const fn ms_to_cycles(ms: u32) -> Option<u32> {
    ms.checked_mul(CYCLES_PER_MS)
}

/// Convert CPU cycles to whole milliseconds.
pub const fn cycles_to_ms(cycles: u32) -> u32 {
    cycles / CYCLES_PER_MS
}

const fn parse_hz(digits: &str) -> u32 {
    let digits = digits.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < digits.len() {
        value = value * 10 + (digits[i] - b'0') as u32;
        i += 1;
    }
    value
}
