use crate::frame::address::{MAC_ADDRESS_SIZE, Mac48Address};
use crate::hal::WifiMacError;

/// A trait for wire structures that can be serialized into and deserialized
/// from a byte buffer.
pub trait Codec: Sized {
    /// Number of bytes `serialize` will write.
    fn serialized_size(&self) -> usize;

    /// Serializes the object into the start of `buffer`.
    /// Returns the number of bytes written.
    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WifiMacError>;

    /// Deserializes an object from the start of `buffer`.
    /// Returns the object and the number of bytes consumed.
    fn deserialize(buffer: &[u8]) -> Result<(Self, usize), WifiMacError>;
}

/// Cursor-style helpers shared by the codecs. Every accessor checks bounds and
/// reports `BufferTooShort` instead of panicking.
pub(crate) struct Writer<'a> {
    buffer: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    fn slot(&mut self, len: usize) -> Result<&mut [u8], WifiMacError> {
        let end = self.pos + len;
        let out = self
            .buffer
            .get_mut(self.pos..end)
            .ok_or(WifiMacError::BufferTooShort)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u16_le(&mut self, value: u16) -> Result<(), WifiMacError> {
        self.slot(2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub(crate) fn u16_be(&mut self, value: u16) -> Result<(), WifiMacError> {
        self.slot(2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub(crate) fn address(&mut self, address: &Mac48Address) -> Result<(), WifiMacError> {
        self.slot(MAC_ADDRESS_SIZE)?.copy_from_slice(&address.0);
        Ok(())
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

pub(crate) struct Reader<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WifiMacError> {
        let end = self.pos + len;
        let out = self
            .buffer
            .get(self.pos..end)
            .ok_or(WifiMacError::BufferTooShort)?;
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn u16_le(&mut self) -> Result<u16, WifiMacError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into()?))
    }

    pub(crate) fn u16_be(&mut self) -> Result<u16, WifiMacError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    pub(crate) fn address(&mut self) -> Result<Mac48Address, WifiMacError> {
        Ok(Mac48Address(self.take(MAC_ADDRESS_SIZE)?.try_into()?))
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}
