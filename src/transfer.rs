//! Chunked memory transfers
//!
//! Arbitrary length reads and writes are split into 256 byte
//! transactions. Windows are independent: a failed write leaves the
//! preceding windows written, and the failing offset is reported so
//! the caller can resume.

use embedded_hal::blocking::delay::DelayMs;

use crate::codec::Violation;
use crate::protocol::MAX_CHUNK;
use crate::{Error, Programmer, SerialPort};

/// Result of comparing device memory against expected contents
#[derive(Clone, Debug, PartialEq)]
pub enum Verify {
    Match,
    Mismatch {
        /// Offset of the first differing byte
        offset: usize,
        expected: u8,
        actual: u8,
    },
}

impl Verify {
    pub fn is_match(&self) -> bool {
        *self == Verify::Match
    }
}

fn check_span<E>(address: u32, length: usize) -> Result<(), Error<E>> {
    if length == 0 {
        return Err(Error::ProtocolViolation(Violation("transfer length must be at least one byte")));
    }
    if address as u64 + length as u64 > 1u64 << 32 {
        return Err(Error::ProtocolViolation(Violation("transfer exceeds the 32-bit address space")));
    }
    Ok(())
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Read `length` bytes of memory starting at `address`
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Error<E>> {
        self.read_with(address, length, |_| ())
    }

    /// Read memory, calling `progress` with the number of bytes read after each window
    pub fn read_with<F>(&mut self, address: u32, length: usize, mut progress: F) -> Result<Vec<u8>, Error<E>>
    where
        F: FnMut(usize),
    {
        check_span(address, length)?;

        let mut data = vec![0u8; length];

        for (i, window) in data.chunks_mut(MAX_CHUNK).enumerate() {
            let offset = i * MAX_CHUNK;
            let addr = address + offset as u32;

            debug!("Read {} bytes at 0x{:08x}", window.len(), addr);
            self.read_memory(addr, window).map_err(|e| Error::Transfer {
                offset,
                cause: Box::new(e),
            })?;

            progress(offset + window.len());
        }

        Ok(data)
    }

    /// Write `data` to memory starting at `address`
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.write_with(address, data, |_| ())
    }

    /// Write memory, calling `progress` with the number of bytes written after each window
    pub fn write_with<F>(&mut self, address: u32, data: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(usize),
    {
        check_span(address, data.len())?;

        for (i, window) in data.chunks(MAX_CHUNK).enumerate() {
            let offset = i * MAX_CHUNK;
            let addr = address + offset as u32;

            debug!("Write {} bytes at 0x{:08x}", window.len(), addr);
            self.write_memory(addr, window).map_err(|e| Error::Transfer {
                offset,
                cause: Box::new(e),
            })?;

            progress(offset + window.len());
        }

        Ok(())
    }

    /// Read back memory and compare against `expected`
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<Verify, Error<E>> {
        self.verify_with(address, expected, |_| ())
    }

    pub fn verify_with<F>(&mut self, address: u32, expected: &[u8], progress: F) -> Result<Verify, Error<E>>
    where
        F: FnMut(usize),
    {
        let actual = self.read_with(address, expected.len(), progress)?;

        let res = match expected.iter().zip(actual.iter()).position(|(e, a)| e != a) {
            Some(offset) => {
                debug!("Verify mismatch at offset 0x{:x}", offset);
                Verify::Mismatch {
                    offset,
                    expected: expected[offset],
                    actual: actual[offset],
                }
            }
            None => Verify::Match,
        };

        Ok(res)
    }
}
