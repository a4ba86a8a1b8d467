use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Line-oriented command shell of a serial DAQ front-end.
pub struct DaqTerminal {
    serial: Box<dyn SerialPort>,
    prompt: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DaqTerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "Timeout error: Expected prompt '{expected}' but got '{actual}'. Likely due to a timeout."
    )]
    Timeout { expected: String, actual: String },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl DaqTerminal {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

    /// Open `port` and bring the shell into a known state.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, DaqTerminalError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;

        let mut terminal = Self::from_port(serial);
        terminal.initialize()?;
        Ok(terminal)
    }

    /// Wrap an already opened port without talking to it.
    pub fn from_port(serial: Box<dyn SerialPort>) -> Self {
        Self {
            serial,
            prompt: "> ".to_string(),
        }
    }

    /// Abort whatever the device is doing and turn on the prompt.
    pub fn initialize(&mut self) -> Result<(), DaqTerminalError> {
        self.flush()?;
        log::debug!("Connected to DAQ shell. Sending CTRL-C to reset.");
        self.send_ctrl_c()?;

        log::debug!("Turning on prompt");
        self.exec("prompt on", Some(Self::DEFAULT_COMMAND_TIMEOUT))?;
        self.flush()
    }

    fn flush(&mut self) -> Result<(), DaqTerminalError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    /// Send `command` and collect the reply up to the next prompt.
    /// `None` waits indefinitely.
    pub fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, DaqTerminalError> {
        let command_with_newline = format!("{command}\n");
        self.serial.write_all(command_with_newline.as_bytes())?;

        let mut response = Vec::new();
        let prompt_bytes = self.prompt.as_bytes();
        let start = Instant::now();

        loop {
            let mut byte = [0u8; 1];
            match self.serial.read_exact(&mut byte) {
                Ok(()) => {
                    response.push(byte[0]);
                    if response.ends_with(prompt_bytes) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if let Some(t) = timeout {
                        if start.elapsed() >= t {
                            return Err(DaqTerminalError::Timeout {
                                expected: self.prompt.clone(),
                                actual: Self::tail(&response),
                            });
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        response.truncate(response.len() - prompt_bytes.len());
        let response_str = String::from_utf8(response)?;
        Ok(response_str.trim().to_string())
    }

    fn tail(response: &[u8]) -> String {
        let from = response.len().saturating_sub(2);
        String::from_utf8_lossy(&response[from..]).to_string()
    }

    /// Send CTRL-C character
    pub fn send_ctrl_c(&mut self) -> Result<(), DaqTerminalError> {
        self.serial.write_all(&[0x03])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_of_short_and_long_responses() {
        assert_eq!(DaqTerminal::tail(b""), "");
        assert_eq!(DaqTerminal::tail(b">"), ">");
        assert_eq!(DaqTerminal::tail(b"0.1,0.2\r\n"), "\r\n");
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = DaqTerminal::open("/dev/does-not-exist-daq", DaqTerminal::DEFAULT_BAUD_RATE);
        assert!(matches!(result, Err(DaqTerminalError::SerialPort(_))));
    }
}
