//! Remote method call envelope carried in the payload of reliable DATA packets.
//!
//! Packed format (all titles except some Quazal ones):
//!
//! ```ascii
//! request:
//!   0: length of the rest (u32)
//!   4: protocol id | 0x80 (u8), or 0xFF followed by the protocol id (u16) if it is >= 0x7F
//!   *: call id (u32)
//!   *: method id (u32)
//!   *: parameters
//! response:
//!   0: length of the rest (u32)
//!   4: protocol id (u8), or 0x7F followed by the protocol id (u16)
//!   *: success (u8)
//!   *: success: call id (u32), method id | 0x8000 (u32), parameters
//!      error: error code (u32), call id (u32)
//! ```
//!
//! The verbose format replaces the numeric IDs by protocol and method names and adds a class
//!  version table to requests.

use anyhow::bail;
use crate::result_code::ResultCode;
use crate::types::ClassVersionContainer;
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut, ByteStreamSettings};
use crate::util::safe_converter::PrecheckedCast;

const REQUEST_FLAG: u8 = 0x80;
const EXTENDED_PROTOCOL_ID: u16 = 0x7F;
const RESPONSE_METHOD_FLAG: u32 = 0x8000;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RmcMessage {
    pub is_request: bool,
    pub is_success: bool,
    pub protocol_id: u16,
    pub protocol_name: String,
    pub call_id: u32,
    pub method_id: u32,
    pub method_name: String,
    pub error_code: u32,
    pub version_container: Option<ClassVersionContainer>,
    pub parameters: Vec<u8>,
}

impl RmcMessage {
    pub fn new_request(protocol_id: u16, method_id: u32, call_id: u32, parameters: Vec<u8>) -> RmcMessage {
        RmcMessage {
            is_request: true,
            protocol_id,
            call_id,
            method_id,
            parameters,
            ..Default::default()
        }
    }

    pub fn new_success(protocol_id: u16, method_id: u32, call_id: u32, parameters: Vec<u8>) -> RmcMessage {
        RmcMessage {
            is_request: false,
            is_success: true,
            protocol_id,
            call_id,
            method_id,
            parameters,
            ..Default::default()
        }
    }

    pub fn new_error(protocol_id: u16, method_id: u32, call_id: u32, error: ResultCode) -> RmcMessage {
        RmcMessage {
            is_request: false,
            is_success: false,
            protocol_id,
            call_id,
            method_id,
            error_code: error.raw(),
            ..Default::default()
        }
    }

    /// an error response addressed to the same protocol, method and call as this request
    pub fn error_response(&self, error: ResultCode) -> RmcMessage {
        let mut response = RmcMessage::new_error(self.protocol_id, self.method_id, self.call_id, error);
        response.protocol_name = self.protocol_name.clone();
        response.method_name = self.method_name.clone();
        response
    }

    pub fn from_bytes(data: &[u8], verbose: bool, settings: ByteStreamSettings) -> anyhow::Result<RmcMessage> {
        let mut stream = ByteStreamIn::new(data, settings);
        let length = stream.read_u32_le()? as usize;
        if stream.remaining() != length {
            bail!("RMC message length {} does not match the {} remaining bytes", length, stream.remaining());
        }

        if verbose {
            Self::decode_verbose(&mut stream)
        }
        else {
            Self::decode_packed(&mut stream)
        }
    }

    fn decode_packed(stream: &mut ByteStreamIn) -> anyhow::Result<RmcMessage> {
        let mut message = RmcMessage::default();

        let raw_protocol_id = stream.read_u8()?;
        message.is_request = raw_protocol_id & REQUEST_FLAG != 0;
        message.protocol_id = (raw_protocol_id & !REQUEST_FLAG) as u16;
        if message.protocol_id == EXTENDED_PROTOCOL_ID {
            message.protocol_id = stream.read_u16_le()?;
        }

        if message.is_request {
            message.call_id = stream.read_u32_le()?;
            message.method_id = stream.read_u32_le()?;
            message.parameters = stream.read_remaining().to_vec();
        }
        else {
            message.is_success = stream.read_bool()?;
            if message.is_success {
                message.call_id = stream.read_u32_le()?;
                message.method_id = stream.read_u32_le()? & !RESPONSE_METHOD_FLAG;
                message.parameters = stream.read_remaining().to_vec();
            }
            else {
                message.error_code = stream.read_u32_le()?;
                message.call_id = stream.read_u32_le()?;
            }
        }
        Ok(message)
    }

    fn decode_verbose(stream: &mut ByteStreamIn) -> anyhow::Result<RmcMessage> {
        let mut message = RmcMessage {
            protocol_name: stream.read_string()?,
            is_request: stream.read_bool()?,
            ..Default::default()
        };

        if message.is_request {
            message.call_id = stream.read_u32_le()?;
            message.method_name = stream.read_string()?;
            message.version_container = Some(ClassVersionContainer::read(stream)?);
            message.parameters = stream.read_remaining().to_vec();
        }
        else {
            message.is_success = stream.read_bool()?;
            if message.is_success {
                message.call_id = stream.read_u32_le()?;
                message.method_name = stream.read_string()?;
                message.parameters = stream.read_remaining().to_vec();
            }
            else {
                message.error_code = stream.read_u32_le()?;
                message.call_id = stream.read_u32_le()?;
            }
        }
        Ok(message)
    }

    pub fn to_bytes(&self, verbose: bool, settings: ByteStreamSettings) -> Vec<u8> {
        let mut body = ByteStreamOut::with_capacity(self.parameters.len() + 32, settings);
        if verbose {
            self.encode_verbose(&mut body);
        }
        else {
            self.encode_packed(&mut body);
        }

        let mut message = ByteStreamOut::with_capacity(body.len() + 4, settings);
        message.write_u32_le(body.len().prechecked_cast());
        message.write_bytes(body.as_slice());
        message.into_vec()
    }

    fn encode_packed(&self, out: &mut ByteStreamOut) {
        let flag = if self.is_request { REQUEST_FLAG } else { 0 };
        if self.protocol_id < EXTENDED_PROTOCOL_ID {
            out.write_u8(self.protocol_id as u8 | flag);
        }
        else {
            out.write_u8(EXTENDED_PROTOCOL_ID as u8 | flag);
            out.write_u16_le(self.protocol_id);
        }

        if self.is_request {
            out.write_u32_le(self.call_id);
            out.write_u32_le(self.method_id);
            out.write_bytes(&self.parameters);
        }
        else {
            out.write_bool(self.is_success);
            if self.is_success {
                out.write_u32_le(self.call_id);
                out.write_u32_le(self.method_id | RESPONSE_METHOD_FLAG);
                out.write_bytes(&self.parameters);
            }
            else {
                out.write_u32_le(self.error_code);
                out.write_u32_le(self.call_id);
            }
        }
    }

    fn encode_verbose(&self, out: &mut ByteStreamOut) {
        out.write_string(&self.protocol_name);
        out.write_bool(self.is_request);

        if self.is_request {
            out.write_u32_le(self.call_id);
            out.write_string(&self.method_name);
            match &self.version_container {
                Some(container) => container.write(out),
                None => out.write_u32_le(0),
            }
            out.write_bytes(&self.parameters);
        }
        else {
            out.write_bool(self.is_success);
            if self.is_success {
                out.write_u32_le(self.call_id);
                out.write_string(&self.method_name);
                out.write_bytes(&self.parameters);
            }
            else {
                out.write_u32_le(self.error_code);
                out.write_u32_le(self.call_id);
            }
        }
    }
}
