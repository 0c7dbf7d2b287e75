//! Protocol constants and command definitions (AN3155)

use core::str::FromStr;

/// Synchronisation (discovery) character, sent once after reset
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum number of bytes moved by a single read or write transaction
pub const MAX_CHUNK: usize = 256;

/// Maximum number of sectors in a single legacy erase or write protect request
pub const MAX_LEGACY_SECTORS: usize = 255;

/// Extended erase special codes
pub const EXT_ERASE_GLOBAL: u16 = 0xFFFF;
pub const EXT_ERASE_BANK1: u16 = 0xFFFE;
pub const EXT_ERASE_BANK2: u16 = 0xFFFD;

/// Extended erase sector numbers at or above this value are reserved
pub const EXT_ERASE_RESERVED: u16 = 0xFFF0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersion,

    /// Gets the chip ID
    GetId,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory,

    /// Erases from one to all the Flash memory pages.
    Erase,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase,

    /// Enables the write protection for some sectors.
    WriteProtect,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect,

    /// Enables the read protection
    ReadoutProtect,

    /// Disables the read protection.
    ReadoutUnprotect,
}

/// Shape of the data a command returns between its acknowledgements
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ResponseShape {
    /// Acknowledgements only
    None,
    /// A fixed number of bytes
    Fixed(usize),
    /// A count byte N followed by N+1 bytes
    LengthPrefixed,
    /// As many bytes as the request asked for
    Requested,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Get,
        Command::GetVersion,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::ExtendedErase,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Get => "Get",
            Command::GetVersion => "GetVersion",
            Command::GetId => "GetId",
            Command::ReadMemory => "ReadMemory",
            Command::Go => "Go",
            Command::WriteMemory => "WriteMemory",
            Command::Erase => "Erase",
            Command::ExtendedErase => "ExtendedErase",
            Command::WriteProtect => "WriteProtect",
            Command::WriteUnprotect => "WriteUnprotect",
            Command::ReadoutProtect => "ReadoutProtect",
            Command::ReadoutUnprotect => "ReadoutUnprotect",
        }
    }

    pub fn response(&self) -> ResponseShape {
        match self {
            Command::Get | Command::GetId => ResponseShape::LengthPrefixed,
            Command::GetVersion => ResponseShape::Fixed(3),
            Command::ReadMemory => ResponseShape::Requested,
            _ => ResponseShape::None,
        }
    }
}

/// Opcode assignment for each command
///
/// Defaults to the values in AN3155, variants that renumber commands
/// can supply their own table.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandTable {
    pub get: u8,
    pub get_version: u8,
    pub get_id: u8,
    pub read_memory: u8,
    pub go: u8,
    pub write_memory: u8,
    pub erase: u8,
    pub extended_erase: u8,
    pub write_protect: u8,
    pub write_unprotect: u8,
    pub readout_protect: u8,
    pub readout_unprotect: u8,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            get: 0x00,
            get_version: 0x01,
            get_id: 0x02,
            read_memory: 0x11,
            go: 0x21,
            write_memory: 0x31,
            erase: 0x43,
            extended_erase: 0x44,
            write_protect: 0x63,
            write_unprotect: 0x73,
            readout_protect: 0x82,
            readout_unprotect: 0x92,
        }
    }
}

impl CommandTable {
    pub fn opcode(&self, command: Command) -> u8 {
        match command {
            Command::Get => self.get,
            Command::GetVersion => self.get_version,
            Command::GetId => self.get_id,
            Command::ReadMemory => self.read_memory,
            Command::Go => self.go,
            Command::WriteMemory => self.write_memory,
            Command::Erase => self.erase,
            Command::ExtendedErase => self.extended_erase,
            Command::WriteProtect => self.write_protect,
            Command::WriteUnprotect => self.write_unprotect,
            Command::ReadoutProtect => self.readout_protect,
            Command::ReadoutUnprotect => self.readout_unprotect,
        }
    }

    /// Look up the command assigned to an opcode
    pub fn command(&self, opcode: u8) -> Option<Command> {
        Command::ALL.iter().copied().find(|c| self.opcode(*c) == opcode)
    }
}

/// Interpreted acknowledgement byte
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Ack {
    Ack,
    Nack,
    Unexpected(u8),
}

impl From<u8> for Ack {
    fn from(v: u8) -> Self {
        match v {
            UART_ACK => Ack::Ack,
            UART_NACK => Ack::Nack,
            other => Ack::Unexpected(other),
        }
    }
}

/// Region to erase
#[derive(Clone, Debug, PartialEq)]
pub enum EraseTarget {
    /// Mass erase of the whole device
    Global,
    /// Bank 1 mass erase (extended erase only)
    Bank1,
    /// Bank 2 mass erase (extended erase only)
    Bank2,
    /// Erase a list of sectors / pages
    Sectors(Vec<u16>),
}

impl FromStr for EraseTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => return Ok(EraseTarget::Global),
            "bank1" => return Ok(EraseTarget::Bank1),
            "bank2" => return Ok(EraseTarget::Bank2),
            _ => (),
        }

        let list = s
            .strip_prefix("sectors:")
            .ok_or_else(|| format!("unrecognised erase target '{}' (expected global, bank1, bank2 or sectors:a,b,..)", s))?;

        let sectors = list
            .split(',')
            .map(|v| v.trim().parse::<u16>().map_err(|e| format!("invalid sector '{}': {}", v, e)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EraseTarget::Sectors(sectors))
    }
}

/// Serial control line
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Signal {
    Rts,
    Dtr,
}

impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rts" => Ok(Signal::Rts),
            "dtr" => Ok(Signal::Dtr),
            _ => Err(format!("unrecognised signal '{}' (expected rts or dtr)", s)),
        }
    }
}
