use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// LOGO! exposes its V memory as data block 1.
pub const LOGO_VM_DB: u16 = 1;

const MAX_S7_BYTE_OFFSET: u32 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    S7,
    Modbus,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::S7 => "s7",
            Protocol::Modbus => "modbus",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s7" => Ok(Protocol::S7),
            "modbus" | "modbus-tcp" => Ok(Protocol::Modbus),
            other => Err(format!("unknown protocol '{other}' (expected s7 or modbus)")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("empty address")]
    Empty,
    #[error("unknown memory area in '{0}'")]
    UnknownArea(String),
    #[error("bit address '{0}' needs both a byte and a bit offset")]
    MissingBit(String),
    #[error("word address '{0}' must not carry a bit offset")]
    UnexpectedBit(String),
    #[error("bit offset out of range (0..=7) in '{0}'")]
    BitOutOfRange(String),
    #[error("invalid offset in '{0}'")]
    InvalidOffset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Area {
    DataBlock,
    Merker,
    Input,
    Output,
}

impl S7Area {
    /// Area code used in S7 variable specifications.
    pub fn code(&self) -> u8 {
        match self {
            S7Area::Input => 0x81,
            S7Area::Output => 0x82,
            S7Area::Merker => 0x83,
            S7Area::DataBlock => 0x84,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Width {
    Bit(u8),
    Byte,
    Word,
    DWord,
}

impl S7Width {
    pub fn size_bytes(&self) -> usize {
        match self {
            S7Width::Bit(_) | S7Width::Byte => 1,
            S7Width::Word => 2,
            S7Width::DWord => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub area: S7Area,
    pub db: u16,
    pub byte: u32,
    pub width: S7Width,
}

impl S7Address {
    /// Start address in bits, as carried in the 24-bit address field.
    pub fn bit_address(&self) -> u32 {
        match self.width {
            S7Width::Bit(bit) => self.byte * 8 + bit as u32,
            _ => self.byte * 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusAddress {
    Coil(u16),
    DiscreteInput(u16),
    HoldingRegister(u16),
    InputRegister(u16),
}

/// A location in PLC memory for one of the supported protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalAddress {
    S7(S7Address),
    Modbus(ModbusAddress),
}

impl PhysicalAddress {
    pub fn parse(protocol: Protocol, text: &str) -> Result<Self, AddressParseError> {
        let normalized = text.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(AddressParseError::Empty);
        }
        match protocol {
            Protocol::S7 => parse_s7(&normalized).map(PhysicalAddress::S7),
            Protocol::Modbus => parse_modbus(&normalized).map(PhysicalAddress::Modbus),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            PhysicalAddress::S7(_) => Protocol::S7,
            PhysicalAddress::Modbus(_) => Protocol::Modbus,
        }
    }

    /// Digital addresses carry booleans; everything else carries integers.
    pub fn is_digital(&self) -> bool {
        match self {
            PhysicalAddress::S7(a) => matches!(a.width, S7Width::Bit(_)),
            PhysicalAddress::Modbus(a) => {
                matches!(a, ModbusAddress::Coil(_) | ModbusAddress::DiscreteInput(_))
            }
        }
    }

    /// Process inputs cannot be written from the bridge.
    pub fn is_writable(&self) -> bool {
        match self {
            PhysicalAddress::S7(a) => a.area != S7Area::Input,
            PhysicalAddress::Modbus(a) => {
                matches!(a, ModbusAddress::Coil(_) | ModbusAddress::HoldingRegister(_))
            }
        }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalAddress::S7(a) => {
                if a.area == S7Area::DataBlock && a.db != LOGO_VM_DB {
                    let kind = match a.width {
                        S7Width::Bit(_) => "X",
                        S7Width::Byte => "B",
                        S7Width::Word => "W",
                        S7Width::DWord => "D",
                    };
                    write!(f, "DB{}.DB{}{}", a.db, kind, a.byte)?;
                    if let S7Width::Bit(bit) = a.width {
                        write!(f, ".{bit}")?;
                    }
                    return Ok(());
                }
                let area = match a.area {
                    S7Area::DataBlock => "V",
                    S7Area::Merker => "M",
                    S7Area::Input => "I",
                    S7Area::Output => "Q",
                };
                match a.width {
                    S7Width::Bit(bit) => write!(f, "{area}{}.{bit}", a.byte),
                    S7Width::Byte => write!(f, "{area}B{}", a.byte),
                    S7Width::Word => write!(f, "{area}W{}", a.byte),
                    S7Width::DWord => write!(f, "{area}D{}", a.byte),
                }
            }
            PhysicalAddress::Modbus(a) => match a {
                ModbusAddress::Coil(n) => write!(f, "C{n}"),
                ModbusAddress::DiscreteInput(n) => write!(f, "DI{n}"),
                ModbusAddress::HoldingRegister(n) => write!(f, "HR{n}"),
                ModbusAddress::InputRegister(n) => write!(f, "IR{n}"),
            },
        }
    }
}

fn parse_s7(text: &str) -> Result<S7Address, AddressParseError> {
    if let Some(rest) = text.strip_prefix("DB") {
        return parse_s7_db(text, rest);
    }

    let mut chars = text.chars();
    let area = match chars.next() {
        Some('V') => S7Area::DataBlock,
        Some('M') => S7Area::Merker,
        Some('I') | Some('E') => S7Area::Input,
        Some('Q') | Some('A') => S7Area::Output,
        _ => return Err(AddressParseError::UnknownArea(text.to_string())),
    };
    let db = if area == S7Area::DataBlock { LOGO_VM_DB } else { 0 };
    let rest = chars.as_str();
    let (kind, offsets) = split_width(rest);
    let width = parse_width(text, kind, offsets)?;
    let byte = parse_byte(text, offsets)?;
    Ok(S7Address {
        area,
        db,
        byte,
        width,
    })
}

fn parse_s7_db(text: &str, rest: &str) -> Result<S7Address, AddressParseError> {
    // DB<n>.DB<X|B|W|D><byte>[.<bit>]
    let (db_part, item) = rest
        .split_once('.')
        .ok_or_else(|| AddressParseError::InvalidOffset(text.to_string()))?;
    let db: u16 = db_part
        .parse()
        .map_err(|_| AddressParseError::InvalidOffset(text.to_string()))?;
    let item = item
        .strip_prefix("DB")
        .ok_or_else(|| AddressParseError::UnknownArea(text.to_string()))?;
    let (kind, offsets) = match item.chars().next() {
        Some('X') => (None, &item[1..]),
        Some('B') | Some('W') | Some('D') => (item.chars().next(), &item[1..]),
        _ => return Err(AddressParseError::UnknownArea(text.to_string())),
    };
    let width = parse_width(text, kind, offsets)?;
    let byte = parse_byte(text, offsets)?;
    Ok(S7Address {
        area: S7Area::DataBlock,
        db,
        byte,
        width,
    })
}

fn split_width(rest: &str) -> (Option<char>, &str) {
    match rest.chars().next() {
        Some(c @ ('B' | 'W' | 'D')) => (Some(c), &rest[1..]),
        Some('X') => (None, &rest[1..]),
        _ => (None, rest),
    }
}

fn parse_width(text: &str, kind: Option<char>, offsets: &str) -> Result<S7Width, AddressParseError> {
    let bit = offsets.split_once('.').map(|(_, bit)| bit);
    match (kind, bit) {
        (None, None) => Err(AddressParseError::MissingBit(text.to_string())),
        (None, Some(bit)) => {
            let bit: u8 = bit
                .parse()
                .map_err(|_| AddressParseError::InvalidOffset(text.to_string()))?;
            if bit > 7 {
                return Err(AddressParseError::BitOutOfRange(text.to_string()));
            }
            Ok(S7Width::Bit(bit))
        }
        (Some(_), Some(_)) => Err(AddressParseError::UnexpectedBit(text.to_string())),
        (Some('B'), None) => Ok(S7Width::Byte),
        (Some('W'), None) => Ok(S7Width::Word),
        (Some(_), None) => Ok(S7Width::DWord),
    }
}

fn parse_byte(text: &str, offsets: &str) -> Result<u32, AddressParseError> {
    let byte_part = offsets.split('.').next().unwrap_or_default();
    let byte: u32 = byte_part
        .parse()
        .map_err(|_| AddressParseError::InvalidOffset(text.to_string()))?;
    if byte > MAX_S7_BYTE_OFFSET {
        return Err(AddressParseError::InvalidOffset(text.to_string()));
    }
    Ok(byte)
}

fn parse_modbus(text: &str) -> Result<ModbusAddress, AddressParseError> {
    let (ctor, digits): (fn(u16) -> ModbusAddress, &str) =
        if let Some(rest) = text.strip_prefix("HR") {
            (ModbusAddress::HoldingRegister, rest)
        } else if let Some(rest) = text.strip_prefix("IR") {
            (ModbusAddress::InputRegister, rest)
        } else if let Some(rest) = text.strip_prefix("DI") {
            (ModbusAddress::DiscreteInput, rest)
        } else if let Some(rest) = text.strip_prefix('C') {
            (ModbusAddress::Coil, rest)
        } else {
            return Err(AddressParseError::UnknownArea(text.to_string()));
        };
    if digits.contains('.') {
        return Err(AddressParseError::UnexpectedBit(text.to_string()));
    }
    let index: u16 = digits
        .parse()
        .map_err(|_| AddressParseError::InvalidOffset(text.to_string()))?;
    Ok(ctor(index))
}
