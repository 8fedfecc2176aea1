use embedded_hal::serial;
use ufmt::{uWrite, uwrite};

use super::{Console, ConsoleOptions};

const LINE_MAX: usize = 32;

const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConsoleError {
    NotInitialized,
    Read,
    Write,
}

/// `ufmt` writer over a serial port
struct Out<'t, T>(&'t mut T);

impl<T: serial::Write<u8>> uWrite for Out<'_, T> {
    type Error = ConsoleError;

    fn write_str(&mut self, s: &str) -> Result<(), ConsoleError> {
        for &byte in s.as_bytes() {
            nb::block!(self.0.write(byte)).map_err(|_| ConsoleError::Write)?;
        }
        Ok(())
    }
}

/// Line console over a serial port
///
/// Understands `help` and `exit`; Ctrl-D also leaves.
pub struct SerialConsole {
    options: Option<ConsoleOptions>,
    line: [u8; LINE_MAX],
    len: usize,
    // Swallow the LF of a CRLF pair
    skip_lf: bool,
}

impl SerialConsole {
    pub const fn new() -> Self {
        Self {
            options: None,
            line: [0; LINE_MAX],
            len: 0,
            skip_lf: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.options.is_some()
    }

    /// Handle a complete line; `true` once the user asked to leave.
    fn execute_line<T: serial::Write<u8>>(
        &mut self,
        out: &mut Out<'_, T>,
    ) -> Result<bool, ConsoleError> {
        let line = &self.line[..self.len];
        let exit = match line {
            b"" => false,
            b"exit" => {
                out.write_str("bye\r\n")?;
                true
            }
            b"help" => {
                out.write_str("commands: help, exit\r\n")?;
                false
            }
            _ => {
                out.write_str("unknown: ")?;
                for &byte in line {
                    nb::block!(out.0.write(byte)).map_err(|_| ConsoleError::Write)?;
                }
                out.write_str("\r\n")?;
                false
            }
        };
        self.len = 0;
        Ok(exit)
    }
}

impl Default for SerialConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Console<T> for SerialConsole
where
    T: serial::Read<u8> + serial::Write<u8>,
{
    type Error = ConsoleError;

    fn is_initialized(&self) -> bool {
        SerialConsole::is_initialized(self)
    }

    fn init(&mut self, transport: &mut T, options: ConsoleOptions) -> Result<(), ConsoleError> {
        let mut out = Out(transport);
        uwrite!(
            out,
            "\r\n{} console v{}\r\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        self.options = Some(options);
        self.len = 0;
        Ok(())
    }

    fn run(&mut self, transport: &mut T, idle: &mut dyn FnMut()) -> Result<(), ConsoleError> {
        let options = self.options.ok_or(ConsoleError::NotInitialized)?;
        Out(&mut *transport).write_str(options.prompt)?;

        loop {
            let byte = match transport.read() {
                Ok(byte) => byte,
                Err(nb::Error::WouldBlock) => {
                    idle();
                    continue;
                }
                Err(nb::Error::Other(_)) => return Err(ConsoleError::Read),
            };
            let skip_lf = core::mem::replace(&mut self.skip_lf, false);
            let mut out = Out(&mut *transport);

            match byte {
                CTRL_D => {
                    out.write_str("\r\n")?;
                    return Ok(());
                }
                b'\n' if skip_lf => {}
                b'\r' | b'\n' => {
                    self.skip_lf = byte == b'\r';
                    out.write_str("\r\n")?;
                    if self.execute_line(&mut out)? {
                        return Ok(());
                    }
                    out.write_str(options.prompt)?;
                }
                BACKSPACE | DELETE => {
                    if self.len > 0 {
                        self.len -= 1;
                        if options.echo {
                            out.write_str("\x08 \x08")?;
                        }
                    }
                }
                _ if self.len < LINE_MAX => {
                    self.line[self.len] = byte;
                    self.len += 1;
                    if options.echo {
                        nb::block!(out.0.write(byte)).map_err(|_| ConsoleError::Write)?;
                    }
                }
                // Line full, drop the byte
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::serial::{Mock, Transaction};
    use embedded_hal_mock::MockError;
    use std::io::ErrorKind;
    use std::format;
    use std::vec::Vec;

    fn banner() -> std::string::String {
        format!(
            "\r\n{} console v{}\r\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
    }

    /// Reads of `text`, each echoed back
    fn typed(text: &[u8]) -> Vec<Transaction<u8>> {
        text.iter()
            .flat_map(|&b| [Transaction::read(b), Transaction::write(b)])
            .collect()
    }

    fn ready_console(serial: &mut Mock<u8>, options: ConsoleOptions) -> SerialConsole {
        let mut console = SerialConsole::new();
        console.init(serial, options).unwrap();
        console
    }

    #[test]
    fn init_prints_the_banner() {
        let mut serial = Mock::new(&[Transaction::write_many(banner().as_bytes())]);
        let mut console = SerialConsole::new();
        assert!(!console.is_initialized());
        console
            .init(&mut serial, ConsoleOptions::default())
            .unwrap();
        assert!(console.is_initialized());
        serial.done();
    }

    #[test]
    fn run_needs_init() {
        let mut serial: Mock<u8> = Mock::new(&[]);
        let mut console = SerialConsole::new();
        assert_eq!(
            console.run(&mut serial, &mut || {}),
            Err(ConsoleError::NotInitialized)
        );
        serial.done();
    }

    #[test]
    fn exit_leaves_the_console() {
        let mut expectations = vec![
            Transaction::write_many(banner().as_bytes()),
            Transaction::write_many(b"> "),
        ];
        expectations.extend(typed(b"exit"));
        expectations.push(Transaction::read(b'\r'));
        expectations.push(Transaction::write_many(b"\r\nbye\r\n"));

        let mut serial = Mock::new(&expectations);
        let mut console = ready_console(&mut serial, ConsoleOptions::default());
        console.run(&mut serial, &mut || {}).unwrap();
        serial.done();
    }

    #[test]
    fn help_then_ctrl_d() {
        let mut expectations = vec![
            Transaction::write_many(banner().as_bytes()),
            Transaction::write_many(b"$ "),
        ];
        expectations.extend(typed(b"help"));
        expectations.push(Transaction::read(b'\r'));
        expectations.push(Transaction::write_many(b"\r\ncommands: help, exit\r\n$ "));
        // LF of the CRLF pair is swallowed
        expectations.push(Transaction::read(b'\n'));
        expectations.push(Transaction::read(CTRL_D));
        expectations.push(Transaction::write_many(b"\r\n"));

        let options = ConsoleOptions {
            echo: true,
            prompt: "$ ",
        };
        let mut serial = Mock::new(&expectations);
        let mut console = ready_console(&mut serial, options);
        console.run(&mut serial, &mut || {}).unwrap();
        serial.done();
    }

    #[test]
    fn silent_editing_and_unknown_commands() {
        let expectations = [
            Transaction::write_many(banner().as_bytes()),
            Transaction::write_many(b"> "),
            Transaction::read_many(b"ab"),
            Transaction::read(DELETE),
            Transaction::read_many(b"c\n"),
            Transaction::write_many(b"\r\nunknown: ac\r\n> "),
            Transaction::read(CTRL_D),
            Transaction::write_many(b"\r\n"),
        ];

        let options = ConsoleOptions {
            echo: false,
            ..ConsoleOptions::default()
        };
        let mut serial = Mock::new(&expectations);
        let mut console = ready_console(&mut serial, options);
        console.run(&mut serial, &mut || {}).unwrap();
        serial.done();
    }

    #[test]
    fn idles_while_waiting_for_input() {
        let expectations = [
            Transaction::write_many(banner().as_bytes()),
            Transaction::write_many(b"> "),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read(b'x'),
            Transaction::write(b'x'),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read(CTRL_D),
            Transaction::write_many(b"\r\n"),
        ];

        let mut serial = Mock::new(&expectations);
        let mut console = ready_console(&mut serial, ConsoleOptions::default());
        let mut idles = 0;
        console.run(&mut serial, &mut || idles += 1).unwrap();
        assert_eq!(idles, 3);
        serial.done();
    }

    #[test]
    fn read_errors_end_the_session() {
        let expectations = [
            Transaction::write_many(banner().as_bytes()),
            Transaction::write_many(b"> "),
            Transaction::read_error(nb::Error::Other(MockError::Io(ErrorKind::BrokenPipe))),
        ];

        let mut serial = Mock::new(&expectations);
        let mut console = ready_console(&mut serial, ConsoleOptions::default());
        assert_eq!(
            console.run(&mut serial, &mut || {}),
            Err(ConsoleError::Read)
        );
        serial.done();
    }
}
