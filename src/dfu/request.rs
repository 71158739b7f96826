//! Control point codec.
//!
//! Inbound frames start with an op-code byte followed by a little-endian
//! payload. Every request is answered by a response frame:
//!
//! ```text
//! [0x60, op-code, result, (ext code | payload...)]
//! ```

use super::config::OpCode;
use super::rescode::{ExtError, Rejection, ResultCode};

/// A decoded control point request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Object type is kept raw so the handler can reject unknown types.
    Create { object_type: u8, size: u32 },
    SetReceiptNotification { prn: u16 },
    CalculateCrc,
    Execute,
    Select { object_type: u8 },
    Write { data: Vec<u8> },
}

/// A frame that could not be decoded into a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub opcode: u8,
    pub code: ResultCode,
}

impl ParseError {
    /// Error response for the rejected frame.
    pub fn response(&self) -> Response {
        Response {
            opcode: self.opcode,
            result: self.code,
            ext_error: None,
            payload: ResponsePayload::None,
        }
    }
}

impl Request {
    /// Decode a control point frame.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        let (&op, payload) = frame.split_first().ok_or(ParseError {
            opcode: 0,
            code: ResultCode::InvalidParameter,
        })?;

        let invalid = ParseError {
            opcode: op,
            code: ResultCode::InvalidParameter,
        };

        let opcode = OpCode::from_byte(op).ok_or(ParseError {
            opcode: op,
            code: ResultCode::OpCodeNotSupported,
        })?;

        match opcode {
            OpCode::Create => match payload {
                [object_type, a, b, c, d] => Ok(Request::Create {
                    object_type: *object_type,
                    size: u32::from_le_bytes([*a, *b, *c, *d]),
                }),
                _ => Err(invalid),
            },
            OpCode::SetReceiptNotification => match payload {
                [lo, hi] => Ok(Request::SetReceiptNotification {
                    prn: u16::from_le_bytes([*lo, *hi]),
                }),
                _ => Err(invalid),
            },
            OpCode::CalculateCrc if payload.is_empty() => Ok(Request::CalculateCrc),
            OpCode::Execute if payload.is_empty() => Ok(Request::Execute),
            OpCode::Select => match payload {
                [object_type] => Ok(Request::Select {
                    object_type: *object_type,
                }),
                _ => Err(invalid),
            },
            OpCode::Write => Ok(Request::Write {
                data: payload.to_vec(),
            }),
            OpCode::CalculateCrc | OpCode::Execute => Err(invalid),
            // Responses only travel device to host.
            OpCode::Response => Err(ParseError {
                opcode: op,
                code: ResultCode::OpCodeNotSupported,
            }),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::SetReceiptNotification { .. } => OpCode::SetReceiptNotification,
            Request::CalculateCrc => OpCode::CalculateCrc,
            Request::Execute => OpCode::Execute,
            Request::Select { .. } => OpCode::Select,
            Request::Write { .. } => OpCode::Write,
        }
    }

    /// Encode back into a control point frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode() as u8];
        match self {
            Request::Create { object_type, size } => {
                frame.push(*object_type);
                frame.extend_from_slice(&size.to_le_bytes());
            }
            Request::SetReceiptNotification { prn } => {
                frame.extend_from_slice(&prn.to_le_bytes());
            }
            Request::Select { object_type } => frame.push(*object_type),
            Request::Write { data } => frame.extend_from_slice(data),
            Request::CalculateCrc | Request::Execute => {}
        }
        frame
    }
}

/// Op-specific data carried by a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePayload {
    None,
    Select { max_size: u32, offset: u32, crc: u32 },
    Crc { offset: u32, crc: u32 },
}

/// A response frame to hand back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Op-code being answered. Raw so unknown op-codes can be echoed.
    pub opcode: u8,
    pub result: ResultCode,
    pub ext_error: Option<ExtError>,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn success(opcode: OpCode, payload: ResponsePayload) -> Self {
        Self {
            opcode: opcode as u8,
            result: ResultCode::Success,
            ext_error: None,
            payload,
        }
    }

    pub fn rejected(opcode: OpCode, rejection: Rejection) -> Self {
        Self {
            opcode: opcode as u8,
            result: rejection.result_code(),
            ext_error: rejection.ext_error(),
            payload: ResponsePayload::None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }

    /// Serialize into the wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(15);
        frame.push(OpCode::Response as u8);
        frame.push(self.opcode);
        frame.push(self.result as u8);

        if self.result == ResultCode::ExtError {
            frame.push(self.ext_error.unwrap_or(ExtError::InvalidErrorCode) as u8);
            return frame;
        }

        if self.result == ResultCode::Success {
            match self.payload {
                ResponsePayload::None => {}
                ResponsePayload::Select {
                    max_size,
                    offset,
                    crc,
                } => {
                    frame.extend_from_slice(&max_size.to_le_bytes());
                    frame.extend_from_slice(&offset.to_le_bytes());
                    frame.extend_from_slice(&crc.to_le_bytes());
                }
                ResponsePayload::Crc { offset, crc } => {
                    frame.extend_from_slice(&offset.to_le_bytes());
                    frame.extend_from_slice(&crc.to_le_bytes());
                }
            }
        }

        frame
    }
}
