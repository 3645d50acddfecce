//! Variables whose value is read out of the target on demand

use crate::transport::{Header, Message};
use hookprof_common::{DataTransferKind, MessageType};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Opaque blob of the given length
    Bytes(u32),
}

impl VariableType {
    #[must_use]
    pub fn size(self) -> u32 {
        match self {
            VariableType::Bool | VariableType::I8 | VariableType::U8 => 1,
            VariableType::I16 | VariableType::U16 => 2,
            VariableType::I32 | VariableType::U32 | VariableType::F32 => 4,
            VariableType::I64 | VariableType::U64 | VariableType::F64 => 8,
            VariableType::Bytes(len) => len,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Bool(v) => write!(f, "{v}"),
            VariableValue::Int(v) => write!(f, "{v}"),
            VariableValue::UInt(v) => write!(f, "{v}"),
            VariableValue::Float(v) => write!(f, "{v}"),
            VariableValue::Bytes(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchedVariable {
    pub name: String,
    pub address: u64,
    pub ty: VariableType,
    value: Option<VariableValue>,
    updates: u64,
}

impl WatchedVariable {
    #[must_use]
    pub fn new(name: impl Into<String>, address: u64, ty: VariableType) -> Self {
        Self { name: name.into(), address, ty, value: None, updates: 0 }
    }

    /// `GetData` request asking the stub for the current bytes
    #[must_use]
    pub fn request(&self, session_id: u32) -> Message {
        Message::new(MessageType::GetData, session_id).with_header(Header::DataTransfer {
            address: self.address,
            kind: DataTransferKind::Data as u32,
            size: self.ty.size(),
        })
    }

    /// Decode bytes sent back by the stub
    ///
    /// Short replies are ignored and leave the previous value in place.
    pub fn receive_value(&mut self, bytes: &[u8]) -> Option<&VariableValue> {
        let size = self.ty.size() as usize;
        if bytes.len() < size {
            log::warn!("{}: expected {size} bytes, got {}", self.name, bytes.len());
            return None;
        }
        let bytes = &bytes[..size];
        let mut raw = [0u8; 8];
        if size <= 8 {
            raw[..size].copy_from_slice(bytes);
        }
        let value = match self.ty {
            VariableType::Bool => VariableValue::Bool(raw[0] != 0),
            VariableType::I8 => VariableValue::Int(i64::from(i8::from_le_bytes([raw[0]]))),
            VariableType::U8 => VariableValue::UInt(u64::from(raw[0])),
            VariableType::I16 => VariableValue::Int(i64::from(i16::from_le_bytes([raw[0], raw[1]]))),
            VariableType::U16 => VariableValue::UInt(u64::from(u16::from_le_bytes([raw[0], raw[1]]))),
            VariableType::I32 => VariableValue::Int(i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))),
            VariableType::U32 => {
                VariableValue::UInt(u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
            }
            VariableType::I64 => VariableValue::Int(i64::from_le_bytes(raw)),
            VariableType::U64 => VariableValue::UInt(u64::from_le_bytes(raw)),
            VariableType::F32 => {
                VariableValue::Float(f64::from(f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
            }
            VariableType::F64 => VariableValue::Float(f64::from_le_bytes(raw)),
            VariableType::Bytes(_) => VariableValue::Bytes(bytes.to_vec()),
        };
        self.updates += 1;
        self.value = Some(value);
        self.value.as_ref()
    }

    #[must_use]
    pub fn value(&self) -> Option<&VariableValue> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates
    }
}
