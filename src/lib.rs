//! STM32 Serial Bootloader.
//!
//! Based on AN3155

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod codec;
pub mod protocol;
mod transfer;

#[cfg(test)]
mod mock;

pub use codec::Violation;
pub use protocol::*;
pub use transfer::Verify;

use codec::{control_byte, encode_address, encode_byte};

/// Serial transport with the two control lines used for reset and boot mode selection
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Link state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    /// No handshake performed (or the chip has left the bootloader)
    Unsynced,
    /// Ready for a command
    Synced,
    /// Sending opcode and control byte
    Issuing,
    /// Waiting for the command acknowledgement
    AwaitingAck,
    /// Exchanging the command payload
    Transacting,
    /// Waiting for the closing acknowledgement
    AwaitingFinalAck,
    /// Boot mode released, the device runs its application
    Released,
    /// Link framing lost, a fresh handshake is required
    Faulted,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("response timeout")]
    Timeout,

    #[error("command 0x{0:02x} rejected (NACK)")]
    Nack(u8),

    #[error("unexpected response byte 0x{0:02x}")]
    UnexpectedResponse(u8),

    #[error("bootloader handshake failed (response: {0:02x?})")]
    HandshakeFailed(Option<u8>),

    #[error("protocol violation: {0}")]
    ProtocolViolation(Violation),

    #[error("operation not supported by this bootloader: {0}")]
    Unsupported(&'static str),

    #[error("invalid session state: {0:?}")]
    InvalidState(State),

    #[error("transfer failed at offset 0x{offset:x}: {cause:?}")]
    Transfer {
        offset: usize,
        cause: Box<Error<SerialError>>,
    },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection or release
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for each bootloader response byte
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold the reset line asserted
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reset_hold_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub init_delay_ms: u32,

    /// Response timeout applied while an extended erase completes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30000"))]
    pub erase_timeout_ms: u32,

    /// Control line connected to the device reset pin (rts, dtr)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "dtr"))]
    pub reset_signal: Signal,

    /// Control line connected to the device boot mode pin (rts, dtr)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "rts"))]
    pub boot_signal: Signal,

    /// Invert control line levels
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub invert_signals: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 100,
            poll_delay_ms: 1,
            reset_hold_ms: 100,
            init_delay_ms: 500,
            erase_timeout_ms: 30_000,
            reset_signal: Signal::Dtr,
            boot_signal: Signal::Rts,
            invert_signals: false,
        }
    }
}

/// Response to the Get command
#[derive(Clone, PartialEq, Debug)]
pub struct Capabilities {
    /// Bootloader version (0x31 is v3.1)
    pub version: u8,
    /// Opcodes supported by the bootloader
    pub commands: Vec<u8>,
}

/// Response to the GetVersion command
#[derive(Clone, PartialEq, Debug)]
pub struct VersionInfo {
    pub version: u8,
    pub option_bytes: [u8; 2],
}

/// Device and bootloader information
#[derive(Clone, PartialEq, Debug)]
pub struct Info {
    pub bootloader_version: u8,
    pub commands: Vec<u8>,
    pub extended_erase: bool,
    pub option_bytes: Option<[u8; 2]>,
    pub chip_id: Option<Vec<u8>>,
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    commands: CommandTable,
    extended_erase: Option<bool>,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Unsynced,
            options,
            commands: CommandTable::default(),
            extended_erase: None,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Replace the default opcode table
    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Whether the bootloader reported extended erase support
    ///
    /// Fixed by the first Get command of a session, false until then.
    pub fn extended_erase_supported(&self) -> bool {
        self.extended_erase.unwrap_or(false)
    }

    /// Reset the device into the bootloader and synchronise
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if self.state == State::Released {
            return Err(Error::InvalidState(self.state));
        }

        self.state = State::Unsynced;
        self.extended_erase = None;

        if !self.options.no_reset {
            debug!("Resetting device into bootloader");

            let boot = self.options.boot_signal;
            if let Err(e) = self.set_signal(boot, true).and_then(|_| self.pulse_reset()) {
                self.state = State::Faulted;
                return Err(e.into());
            }
        }

        debug!("Sending discovery character");
        if let Err(e) = self.write_bytes(&[protocol::UART_DISC]) {
            self.state = State::Faulted;
            return Err(e);
        }

        debug!("Awaiting bootloader response");
        match self.read_ack() {
            Ok(Ack::Ack) => {
                debug!("Bootloader synchronised");
                self.state = State::Synced;
                Ok(())
            }
            Ok(Ack::Nack) => Err(Error::HandshakeFailed(Some(protocol::UART_NACK))),
            Ok(Ack::Unexpected(v)) => Err(Error::HandshakeFailed(Some(v))),
            Err(Error::Timeout) => Err(Error::HandshakeFailed(None)),
            Err(e) => {
                self.state = State::Faulted;
                Err(e)
            }
        }
    }

    /// Release boot mode and reset the device into its application
    ///
    /// Control line failures are logged, the session ends regardless.
    pub fn release(&mut self) {
        debug!("Releasing device (state: {:?})", self.state);

        if !self.options.no_reset {
            let boot = self.options.boot_signal;
            if let Err(e) = self.set_signal(boot, false) {
                warn!("Failed to release boot signal: {:?}", e);
            }
            if let Err(e) = self.pulse_reset() {
                warn!("Failed to reset device: {:?}", e);
            }
        }

        self.state = State::Released;
    }

    /// Fetch the bootloader version and supported commands
    ///
    /// The first call records whether extended erase is available.
    pub fn get(&mut self) -> Result<Capabilities, Error<E>> {
        let caps = self.transact(Command::Get, |s, opcode| {
            let data = s.read_response(Command::Get)?;
            s.final_ack(opcode)?;

            Ok(Capabilities {
                version: data[0],
                commands: data[1..].to_vec(),
            })
        })?;

        debug!("Bootloader version: 0x{:02x}, commands: {:02x?}", caps.version, caps.commands);

        if self.extended_erase.is_none() {
            let extended = caps.commands.contains(&self.commands.extended_erase);
            debug!("Extended erase supported: {}", extended);
            self.extended_erase = Some(extended);
        }

        Ok(caps)
    }

    /// Fetch the bootloader version and option bytes
    pub fn get_version(&mut self) -> Result<VersionInfo, Error<E>> {
        self.transact(Command::GetVersion, |s, opcode| {
            let data = s.read_response(Command::GetVersion)?;
            s.final_ack(opcode)?;

            Ok(VersionInfo {
                version: data[0],
                option_bytes: [data[1], data[2]],
            })
        })
    }

    /// Fetch the chip product ID
    pub fn get_id(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.transact(Command::GetId, |s, opcode| {
            let id = s.read_response(Command::GetId)?;
            s.final_ack(opcode)?;
            Ok(id)
        })
    }

    /// Collect bootloader and device information
    ///
    /// GetVersion and GetId are only issued when the bootloader lists them.
    pub fn get_info(&mut self) -> Result<Info, Error<E>> {
        let caps = self.get()?;

        let option_bytes = if caps.commands.contains(&self.commands.get_version) {
            Some(self.get_version()?.option_bytes)
        } else {
            None
        };

        let chip_id = if caps.commands.contains(&self.commands.get_id) {
            Some(self.get_id()?)
        } else {
            None
        };

        Ok(Info {
            bootloader_version: caps.version,
            commands: caps.commands,
            extended_erase: self.extended_erase_supported(),
            option_bytes,
            chip_id,
        })
    }

    /// Read up to 256 bytes of memory into `data`
    pub fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), Error<E>> {
        let len = codec::encode_read_length(data.len()).map_err(Error::ProtocolViolation)?;

        self.transact(Command::ReadMemory, |s, opcode| {
            s.write_bytes(&encode_address(address))?;
            s.await_ack(opcode)?;

            s.write_bytes(&len)?;
            s.await_ack(opcode)?;

            s.read_exact(data)
        })
    }

    /// Write up to 256 bytes of memory
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let block = codec::encode_write_block(data).map_err(Error::ProtocolViolation)?;

        self.transact(Command::WriteMemory, |s, opcode| {
            s.write_bytes(&encode_address(address))?;
            s.await_ack(opcode)?;

            s.write_bytes(&block)?;
            s.final_ack(opcode)
        })
    }

    /// Jump to the application at `address`, leaving the bootloader
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.transact(Command::Go, |s, opcode| {
            s.write_bytes(&encode_address(address))?;
            s.final_ack(opcode)
        })?;

        self.state = State::Unsynced;
        Ok(())
    }

    /// Erase flash memory
    ///
    /// Uses extended erase when the bootloader supports it, issuing a
    /// Get first if the capability is not yet known.
    pub fn erase(&mut self, target: &EraseTarget) -> Result<(), Error<E>> {
        if self.extended_erase.is_none() {
            debug!("Erase capability unknown, querying bootloader");
            self.get()?;
        }

        if self.extended_erase_supported() {
            let payload = codec::encode_extended_erase(target).map_err(Error::ProtocolViolation)?;
            let timeout = self.options.erase_timeout_ms;

            self.transact(Command::ExtendedErase, |s, opcode| {
                s.write_bytes(&payload)?;

                info!("Extended erase in progress, this can take ten seconds or more");
                s.with_timeout(timeout, |s| s.final_ack(opcode))
            })
        } else {
            if let EraseTarget::Bank1 | EraseTarget::Bank2 = target {
                return Err(Error::Unsupported("bank erase requires extended erase"));
            }
            let payload = codec::encode_legacy_erase(target).map_err(Error::ProtocolViolation)?;

            self.transact(Command::Erase, |s, opcode| {
                s.write_bytes(&payload)?;
                s.final_ack(opcode)
            })
        }
    }

    /// Enable write protection for the listed sectors
    ///
    /// The device resets afterwards, requiring a new handshake.
    pub fn write_protect(&mut self, sectors: &[u16]) -> Result<(), Error<E>> {
        let payload = codec::encode_sector_list(sectors).map_err(Error::ProtocolViolation)?;

        self.transact(Command::WriteProtect, |s, opcode| {
            s.write_bytes(&payload)?;
            s.final_ack(opcode)
        })?;

        self.state = State::Unsynced;
        Ok(())
    }

    /// Disable write protection for all sectors
    ///
    /// The device resets afterwards, requiring a new handshake.
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        self.protection_command(Command::WriteUnprotect)
    }

    /// Enable readout protection
    ///
    /// The device resets afterwards, requiring a new handshake.
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.protection_command(Command::ReadoutProtect)
    }

    /// Disable readout protection, mass erasing the flash
    ///
    /// The device resets afterwards, requiring a new handshake.
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        self.protection_command(Command::ReadoutUnprotect)
    }

    fn protection_command(&mut self, command: Command) -> Result<(), Error<E>> {
        // Acknowledged on receipt and again once the option bytes are updated
        self.transact(command, |s, opcode| s.final_ack(opcode))?;

        self.state = State::Unsynced;
        Ok(())
    }

    /// Issue a command and run its transaction, tracking link state
    ///
    /// A NACK leaves the link synchronised, any other failure faults it.
    fn transact<T, F>(&mut self, command: Command, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Self, u8) -> Result<T, Error<E>>,
    {
        if self.state != State::Synced {
            return Err(Error::InvalidState(self.state));
        }

        let opcode = self.commands.opcode(command);
        debug!("Issuing {} (0x{:02x})", command.name(), opcode);

        match self.issue(opcode, f) {
            Ok(v) => {
                self.state = State::Synced;
                Ok(v)
            }
            Err(e) => {
                self.state = match e {
                    Error::Nack(_) => State::Synced,
                    _ => State::Faulted,
                };
                debug!("{} failed: {:?} (state: {:?})", command.name(), e, self.state);
                Err(e)
            }
        }
    }

    fn issue<T, F>(&mut self, opcode: u8, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Self, u8) -> Result<T, Error<E>>,
    {
        self.state = State::Issuing;
        self.write_bytes(&[encode_byte(opcode), control_byte(opcode)])?;

        self.state = State::AwaitingAck;
        self.await_ack(opcode)?;

        self.state = State::Transacting;
        f(self, opcode)
    }

    /// Run `f` with a different response timeout, restoring the previous one after
    fn with_timeout<T, F>(&mut self, timeout_ms: u32, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Self) -> Result<T, Error<E>>,
    {
        let previous = core::mem::replace(&mut self.options.response_timeout_ms, timeout_ms);
        let res = f(self);
        self.options.response_timeout_ms = previous;
        res
    }

    /// Read the data a command returns ahead of its final acknowledgement
    fn read_response(&mut self, command: Command) -> Result<Vec<u8>, Error<E>> {
        let len = match command.response() {
            ResponseShape::None => 0,
            ResponseShape::Fixed(n) => n,
            ResponseShape::LengthPrefixed => self.read_byte()? as usize + 1,
            ResponseShape::Requested => {
                return Err(Error::ProtocolViolation(Violation("response length must be requested")))
            }
        };

        let mut data = vec![0u8; len];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    fn final_ack(&mut self, opcode: u8) -> Result<(), Error<E>> {
        self.state = State::AwaitingFinalAck;
        self.await_ack(opcode)
    }

    fn await_ack(&mut self, opcode: u8) -> Result<(), Error<E>> {
        match self.read_ack()? {
            Ack::Ack => {
                trace!("Received bootloader ack");
                Ok(())
            }
            Ack::Nack => {
                let name = self.commands.command(opcode).map(|c| c.name()).unwrap_or("unknown");
                debug!("Received bootloader nack ({})", name);
                Err(Error::Nack(opcode))
            }
            Ack::Unexpected(v) => {
                debug!("Received unexpected value: 0x{:02x}", v);
                Err(Error::UnexpectedResponse(v))
            }
        }
    }

    fn read_ack(&mut self) -> Result<Ack, Error<E>> {
        self.read_byte().map(Ack::from)
    }

    fn read_exact(&mut self, data: &mut [u8]) -> Result<(), Error<E>> {
        for b in data.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let poll = self.options.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => {
                    trace!("RX: 0x{:02x}", v);
                    return Ok(v);
                }
            };

            if t >= self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::Timeout);
            }

            // Wait for delay period
            self.delay.delay_ms(poll);
            t += poll;
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        trace!("TX: {:02x?}", data);

        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn set_signal(&mut self, signal: Signal, asserted: bool) -> Result<(), E> {
        let level = asserted ^ self.options.invert_signals;
        match signal {
            Signal::Rts => self.port.set_rts(level),
            Signal::Dtr => self.port.set_dtr(level),
        }
    }

    fn pulse_reset(&mut self) -> Result<(), E> {
        let reset = self.options.reset_signal;

        self.set_signal(reset, true)?;
        self.delay.delay_ms(self.options.reset_hold_ms);

        self.set_signal(reset, false)?;
        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }
}
