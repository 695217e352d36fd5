//! Minimal TLS ClientHello parsing: just enough to pull out the SNI
//! hostname. This deliberately does not validate or understand the
//! rest of the handshake.

use crate::error::{Error, ErrorKind, Result};

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST_NAME: u8 = 0x00;

fn is_supported_version(version: u16) -> bool {
    matches!(version, 0x0301 | 0x0302 | 0x0303)
}

/// A tiny bounds-checked cursor over a TLS record.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::new(ErrorKind::Protocol))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// The byte length of the TLS record header (content type + version +
/// length) that precedes the handshake body.
pub const RECORD_HEADER_LENGTH: usize = 5;

/// Given just the 5-byte TLS record header, return how many more bytes make
/// up the rest of the record (the handshake message).
pub fn record_body_length(header: &[u8]) -> Result<usize> {
    if header.len() < RECORD_HEADER_LENGTH {
        return Err(Error::new(ErrorKind::Protocol));
    }
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(Error::new(ErrorKind::Protocol));
    }
    let version = u16::from_be_bytes([header[1], header[2]]);
    if !is_supported_version(version) {
        return Err(Error::new(ErrorKind::Protocol));
    }
    Ok(u16::from_be_bytes([header[3], header[4]]) as usize)
}

/// Parse a full TLS record (header + handshake body) and return the first
/// `host_name` entry of its SNI extension, if present. Hostname comparisons
/// downstream are case-insensitive; this returns the bytes as given on the
/// wire.
pub fn parse_server_name(record: &[u8]) -> Result<Option<String>> {
    let mut cursor = Cursor::new(record);
    cursor.u8()?; // content type, already validated by the caller
    cursor.u16()?; // record version
    let record_length = cursor.u16()? as usize;
    let handshake = cursor.take(record_length)?;

    let mut hs = Cursor::new(handshake);
    if hs.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(Error::new(ErrorKind::Protocol));
    }
    let hs_length = hs.u24()? as usize;
    let body = hs.take(hs_length)?;

    let mut cur = Cursor::new(body);
    cur.u16()?; // client version
    cur.take(32)?; // random

    let session_id_len = cur.u8()? as usize;
    cur.take(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    cur.take(cipher_suites_len)?;

    let compression_methods_len = cur.u8()? as usize;
    cur.take(compression_methods_len)?;

    if cur.remaining() == 0 {
        // no extensions present, hence no SNI
        return Ok(None);
    }

    let extensions_len = cur.u16()? as usize;
    let extensions = cur.take(extensions_len)?;
    let mut ext_cursor = Cursor::new(extensions);

    while ext_cursor.remaining() > 0 {
        let ext_type = ext_cursor.u16()?;
        let ext_len = ext_cursor.u16()? as usize;
        let ext_data = ext_cursor.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return Ok(parse_server_name_extension(ext_data)?);
        }
    }

    Ok(None)
}

fn parse_server_name_extension(data: &[u8]) -> Result<Option<String>> {
    let mut cursor = Cursor::new(data);
    let list_len = cursor.u16()? as usize;
    let list = cursor.take(list_len)?;
    let mut list_cursor = Cursor::new(list);

    while list_cursor.remaining() > 0 {
        let name_type = list_cursor.u8()?;
        let name_len = list_cursor.u16()? as usize;
        let name = list_cursor.take(name_len)?;

        if name_type == SERVER_NAME_TYPE_HOST_NAME {
            let name = std::str::from_utf8(name).map_err(|e| Error::wrap(ErrorKind::Protocol, e))?;
            return Ok(Some(name.to_string()));
        }
    }

    Ok(None)
}
