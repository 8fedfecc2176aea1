#![cfg_attr(target_arch = "avr", no_std, no_main, feature(abi_avr_interrupt))]

#[cfg(target_arch = "avr")]
mod firmware {
    use core::cell::RefCell;
    use core::sync::atomic::AtomicBool;

    use avr_device::atmega128a::{Peripherals, PORTB, TC1};
    use critical_section::Mutex;
    use panic_halt as _;

    use avr_runloop::config;
    use avr_runloop::drivers::SerialConsole;
    use avr_runloop::hal::{AvrPlatform, Power, Uart, Watchdog};
    use avr_runloop::{Runloop, Scheduler, TaskError, TaskId, TimerSlot};

    /// Heartbeat LED on PB0
    const LED: u8 = 1 << 0;

    // Global state for interrupt handling
    static TIMER1: TimerSlot<TC1, &'static AtomicBool> = TimerSlot::new();
    static RUNLOOP: Runloop<()> = Runloop::new();
    static LED_PORT: Mutex<RefCell<Option<PORTB>>> = Mutex::new(RefCell::new(None));

    #[avr_device::interrupt(atmega128a)]
    fn TIMER1_OVF() {
        TIMER1.on_overflow();
    }

    #[avr_device::interrupt(atmega128a)]
    fn TIMER1_COMPA() {
        TIMER1.on_compare_match();
    }

    fn with_led(f: impl FnOnce(&PORTB)) {
        critical_section::with(|cs| {
            if let Some(port) = LED_PORT.borrow_ref(cs).as_ref() {
                f(port);
            }
        });
    }

    fn heartbeat(_: ()) -> Result<(), TaskError> {
        with_led(|port| port.portb.modify(|r, w| unsafe { w.bits(r.bits() ^ LED) }));
        Ok(())
    }

    fn task_failed(_: (), _: TaskId, _: u8) {
        // Leave the LED lit to show the failure
        with_led(|port| port.portb.modify(|r, w| unsafe { w.bits(r.bits() | LED) }));
    }

    /// Stop feeding the watchdog and wait for it to reset the board.
    fn reset_by_watchdog() -> ! {
        avr_device::interrupt::disable();
        loop {
            avr_device::asm::nop();
        }
    }

    #[avr_device::entry]
    fn main() -> ! {
        let Some(dp) = Peripherals::take() else {
            reset_by_watchdog()
        };

        let mut watchdog = Watchdog::new(dp.WDT);
        watchdog.start(config::WDT_TIMEOUT);
        let mut platform = AvrPlatform::new(Power::new(dp.CPU), watchdog);

        dp.PORTB.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | LED) });
        critical_section::with(|cs| LED_PORT.borrow(cs).replace(Some(dp.PORTB)));

        let uart = Uart::new(dp.USART0);
        let Ok(mut scheduler) = Scheduler::init(
            &RUNLOOP,
            &TIMER1,
            dp.TC1,
            None,
            uart,
            SerialConsole::new(),
        ) else {
            reset_by_watchdog()
        };
        scheduler.on_task_error(Some(task_failed));

        if RUNLOOP.add_task(heartbeat, (), 0, 500, 0).is_err() {
            reset_by_watchdog()
        }

        // Enable interrupts globally
        unsafe { avr_device::interrupt::enable() };

        // Nothing stops this runloop; returning means the timer failed
        let _ = scheduler.run(&mut platform);
        reset_by_watchdog()
    }
}

#[cfg(not(target_arch = "avr"))]
fn main() {}
