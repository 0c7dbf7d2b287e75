use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

/// Programmer using a linux serial port
pub type LinuxProgrammer = Programmer<Serial, Delay, IoErrorKind>;

fn kind(e: SerialError) -> IoErrorKind {
    std::io::Error::from(e).kind()
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(kind)
    }
}

impl LinuxProgrammer {
    /// Create a new linux serial port programmer instance
    ///
    /// The port is configured for 8E1 framing without flow control.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityEven);

        port.0.write_settings(&settings)?;

        // Reads return after one poll period so response timeouts stay with the programmer
        let poll = options.poll_delay_ms.max(1);
        port.0.set_timeout(Duration::from_millis(poll as u64))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
