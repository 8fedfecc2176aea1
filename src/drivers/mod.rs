pub mod serial_console;

pub use serial_console::{ConsoleError, SerialConsole};

/// Console behaviour chosen at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleOptions {
    /// Echo typed characters back
    pub echo: bool,
    pub prompt: &'static str,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            echo: true,
            prompt: "> ",
        }
    }
}

/// Interactive console the runloop hands the CPU to on request
pub trait Console<T> {
    type Error;

    fn is_initialized(&self) -> bool;

    fn init(&mut self, transport: &mut T, options: ConsoleOptions) -> Result<(), Self::Error>;

    /// Serve the user until they leave the console.
    ///
    /// `idle` runs every time the console finds no input waiting; the
    /// runloop feeds the watchdog from it.
    fn run(&mut self, transport: &mut T, idle: &mut dyn FnMut()) -> Result<(), Self::Error>;
}
