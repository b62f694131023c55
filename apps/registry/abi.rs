use alloy::primitives::{Address, I256, U256};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap());

/// A single parameter declaration from a contract ABI. `components` is only
/// populated for tuples (and arrays of tuples).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    pub fn unnamed(kind: &str) -> Self {
        Self {
            name: String::new(),
            kind: kind.to_string(),
            components: vec![],
        }
    }
}

/// The closed set of ABI item kinds we interpret. Anything else
/// (receive, fallback, future additions) deserializes to `Unknown`
/// and is filtered out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AbiItem {
    Function {
        name: String,
        #[serde(default)]
        inputs: Vec<AbiParam>,
        #[serde(default)]
        outputs: Vec<AbiParam>,
        #[serde(default, rename = "stateMutability")]
        state_mutability: Option<String>,
    },
    Constructor {
        #[serde(default)]
        inputs: Vec<AbiParam>,
    },
    Event {
        name: String,
        #[serde(default)]
        inputs: Vec<serde_json::Value>,
    },
    Error {
        name: String,
        #[serde(default)]
        inputs: Vec<AbiParam>,
    },
    #[serde(other)]
    Unknown,
}

/// A callable function extracted from an ABI, input types kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedFunction {
    pub name: String,
    pub inputs: Vec<AbiParam>,
    pub outputs: Vec<AbiParam>,
    pub state_mutability: Option<String>,
}

impl ParsedFunction {
    /// Human-readable signature used by the function picker.
    pub fn signature(&self) -> String {
        let inputs = self
            .inputs
            .iter()
            .map(|p| p.kind.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}({})", self.name, inputs)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedAbi {
    pub functions: Vec<ParsedFunction>,
    pub raw: serde_json::Value,
}

impl ParsedAbi {
    pub fn function(&self, name: &str) -> Option<&ParsedFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("ABI is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("ABI must be a JSON array of items")]
    NotAnArray,
    #[error("ABI item {index} is malformed: {message}")]
    InvalidItem { index: usize, message: String },
}

/// Parses raw ABI text into the ordered list of callable functions.
///
/// Declaration order is preserved; non-function items and unknown item
/// kinds are filtered out silently. A parse failure never partially
/// populates the result.
pub fn parse_abi(text: &str) -> Result<ParsedAbi, AbiError> {
    let raw: serde_json::Value = serde_json::from_str(text).map_err(AbiError::Json)?;
    let items = raw.as_array().ok_or(AbiError::NotAnArray)?;

    let mut functions = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if !item.is_object() {
            return Err(AbiError::InvalidItem {
                index,
                message: "expected an object".to_string(),
            });
        }
        match serde_json::from_value::<AbiItem>(item.clone()) {
            Ok(AbiItem::Function {
                name,
                inputs,
                outputs,
                state_mutability,
            }) => functions.push(ParsedFunction {
                name,
                inputs,
                outputs,
                state_mutability,
            }),
            Ok(_) => {}
            Err(e) => {
                return Err(AbiError::InvalidItem {
                    index,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(ParsedAbi {
        functions,
        raw: raw.clone(),
    })
}

/// A user-supplied argument coerced to its declared Solidity type.
/// Integers are kept as 256-bit values, never as floats, so nothing
/// above 2^53 loses precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedValue {
    Address(Address),
    Uint(U256),
    Int(I256),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<ValidatedValue>),
    Tuple(Vec<ValidatedValue>),
}

impl ValidatedValue {
    /// Canonical JSON rendering: integers and byte strings as strings so
    /// round-tripping through JSON never goes through f64.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ValidatedValue::Address(a) => serde_json::Value::String(a.to_checksum(None)),
            ValidatedValue::Uint(v) => serde_json::Value::String(v.to_string()),
            ValidatedValue::Int(v) => serde_json::Value::String(v.to_string()),
            ValidatedValue::Bool(b) => serde_json::Value::Bool(*b),
            ValidatedValue::Bytes(b) => {
                serde_json::Value::String(format!("0x{}", alloy::hex::encode(b)))
            }
            ValidatedValue::String(s) => serde_json::Value::String(s.clone()),
            ValidatedValue::Array(items) | ValidatedValue::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("'{value}' is not a valid address")]
    InvalidAddress { value: String },
    #[error("'{value}' is not a valid integer for {ty}")]
    InvalidInteger { value: String, ty: String },
    #[error("'{value}' is out of range for {ty}")]
    OutOfRange { value: String, ty: String },
    #[error("'{value}' is not a boolean (expected true or false)")]
    InvalidBool { value: String },
    #[error("'{value}' is not a valid hex string")]
    InvalidHex { value: String },
    #[error("{ty} expects {expected} bytes, got {actual}")]
    WrongByteLength {
        ty: String,
        expected: usize,
        actual: usize,
    },
    #[error("expected a JSON array for {ty}")]
    NotAnArray { ty: String },
    #[error("{ty} expects exactly {expected} elements, got {actual}")]
    WrongArrayLength {
        ty: String,
        expected: usize,
        actual: usize,
    },
    #[error("element {index}: {source}")]
    Element {
        index: usize,
        #[source]
        source: Box<InputError>,
    },
    #[error("expected a JSON array or object for tuple")]
    NotATuple,
    #[error("tuple is missing component '{name}'")]
    MissingComponent { name: String },
    #[error("tuple type has no component declarations")]
    MissingComponents,
    #[error("unsupported type '{ty}'")]
    UnsupportedType { ty: String },
}

/// Validates a raw string argument against a declared parameter and
/// coerces it. Failures are returned as values so the form can report
/// them per field while the rest of the inputs stay editable.
pub fn validate_input(value: &str, param: &AbiParam) -> Result<ValidatedValue, InputError> {
    let ty = param.kind.as_str();

    if let Some((base, size)) = split_array_type(ty) {
        return validate_array(value, base, size, param);
    }

    if ty == "tuple" {
        return validate_tuple(value, &param.components);
    }

    if ty == "address" {
        return validate_address(value);
    }

    if ty == "bool" {
        return validate_bool(value);
    }

    if ty == "string" {
        return Ok(ValidatedValue::String(value.to_string()));
    }

    if ty == "bytes" || (ty.starts_with("bytes") && ty[5..].parse::<usize>().is_ok()) {
        return validate_bytes(value, ty);
    }

    if let Some((signed, width)) = int_width(ty) {
        return if signed {
            validate_int(value, width, ty)
        } else {
            validate_uint(value, width, ty)
        };
    }

    Err(InputError::UnsupportedType { ty: ty.to_string() })
}

/// Convenience wrapper for flat types where no components are involved.
pub fn validate_type(value: &str, ty: &str) -> Result<ValidatedValue, InputError> {
    validate_input(value, &AbiParam::unnamed(ty))
}

fn validate_address(value: &str) -> Result<ValidatedValue, InputError> {
    let v = value.trim();
    if !ADDRESS_RE.is_match(v) {
        return Err(InputError::InvalidAddress {
            value: value.to_string(),
        });
    }
    let address = Address::from_str(v).map_err(|_| InputError::InvalidAddress {
        value: value.to_string(),
    })?;
    Ok(ValidatedValue::Address(address))
}

fn validate_bool(value: &str) -> Result<ValidatedValue, InputError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(ValidatedValue::Bool(true)),
        "false" => Ok(ValidatedValue::Bool(false)),
        _ => Err(InputError::InvalidBool {
            value: value.to_string(),
        }),
    }
}

fn validate_bytes(value: &str, ty: &str) -> Result<ValidatedValue, InputError> {
    let v = value.trim();
    let bytes = alloy::hex::decode(v).map_err(|_| InputError::InvalidHex {
        value: value.to_string(),
    })?;
    if ty != "bytes" {
        let expected: usize = ty[5..].parse().map_err(|_| InputError::UnsupportedType {
            ty: ty.to_string(),
        })?;
        if expected == 0 || expected > 32 {
            return Err(InputError::UnsupportedType { ty: ty.to_string() });
        }
        if bytes.len() != expected {
            return Err(InputError::WrongByteLength {
                ty: ty.to_string(),
                expected,
                actual: bytes.len(),
            });
        }
    }
    Ok(ValidatedValue::Bytes(bytes))
}

fn int_width(ty: &str) -> Option<(bool, u32)> {
    let (signed, rest) = if let Some(rest) = ty.strip_prefix("uint") {
        (false, rest)
    } else if let Some(rest) = ty.strip_prefix("int") {
        (true, rest)
    } else {
        return None;
    };
    let width: u32 = if rest.is_empty() {
        256
    } else {
        rest.parse().ok()?
    };
    if width == 0 || width > 256 || width % 8 != 0 {
        return None;
    }
    Some((signed, width))
}

fn parse_magnitude(digits: &str) -> Option<U256> {
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        U256::from_str_radix(hex, 16).ok()
    } else {
        U256::from_str_radix(digits, 10).ok()
    }
}

fn validate_uint(value: &str, width: u32, ty: &str) -> Result<ValidatedValue, InputError> {
    let v = value.trim();
    let parsed = parse_magnitude(v).ok_or_else(|| InputError::InvalidInteger {
        value: value.to_string(),
        ty: ty.to_string(),
    })?;
    if width < 256 && parsed >= (U256::from(1u8) << width) {
        return Err(InputError::OutOfRange {
            value: value.to_string(),
            ty: ty.to_string(),
        });
    }
    Ok(ValidatedValue::Uint(parsed))
}

fn validate_int(value: &str, width: u32, ty: &str) -> Result<ValidatedValue, InputError> {
    let v = value.trim();
    let (negative, digits) = match v.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, v),
    };
    let magnitude = parse_magnitude(digits).ok_or_else(|| InputError::InvalidInteger {
        value: value.to_string(),
        ty: ty.to_string(),
    })?;

    // signed range: [-2^(N-1), 2^(N-1))
    let bound = U256::from(1u8) << (width - 1);
    let in_range = if negative {
        magnitude <= bound
    } else {
        magnitude < bound
    };
    if !in_range {
        return Err(InputError::OutOfRange {
            value: value.to_string(),
            ty: ty.to_string(),
        });
    }

    let parsed = if negative {
        // two's complement negation keeps -2^255 representable
        I256::from_raw(magnitude.wrapping_neg())
    } else {
        I256::from_raw(magnitude)
    };
    Ok(ValidatedValue::Int(parsed))
}

fn split_array_type(ty: &str) -> Option<(&str, Option<usize>)> {
    let rest = ty.strip_suffix(']')?;
    let idx = rest.rfind('[')?;
    let size_text = &rest[idx + 1..];
    let size = if size_text.is_empty() {
        None
    } else {
        Some(size_text.parse().ok()?)
    };
    Some((&rest[..idx], size))
}

fn json_value_to_input(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_array(
    value: &str,
    base: &str,
    size: Option<usize>,
    param: &AbiParam,
) -> Result<ValidatedValue, InputError> {
    let parsed: serde_json::Value =
        serde_json::from_str(value.trim()).map_err(|_| InputError::NotAnArray {
            ty: param.kind.clone(),
        })?;
    let items = parsed.as_array().ok_or_else(|| InputError::NotAnArray {
        ty: param.kind.clone(),
    })?;

    if let Some(expected) = size {
        if items.len() != expected {
            return Err(InputError::WrongArrayLength {
                ty: param.kind.clone(),
                expected,
                actual: items.len(),
            });
        }
    }

    let element_param = AbiParam {
        name: param.name.clone(),
        kind: base.to_string(),
        components: param.components.clone(),
    };

    let mut validated = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let element =
            validate_input(&json_value_to_input(item), &element_param).map_err(|source| {
                InputError::Element {
                    index,
                    source: Box::new(source),
                }
            })?;
        validated.push(element);
    }
    Ok(ValidatedValue::Array(validated))
}

fn validate_tuple(value: &str, components: &[AbiParam]) -> Result<ValidatedValue, InputError> {
    if components.is_empty() {
        return Err(InputError::MissingComponents);
    }

    let parsed: serde_json::Value =
        serde_json::from_str(value.trim()).map_err(|_| InputError::NotATuple)?;

    let ordered: Vec<String> = match &parsed {
        serde_json::Value::Array(items) => {
            if items.len() != components.len() {
                return Err(InputError::WrongArrayLength {
                    ty: "tuple".to_string(),
                    expected: components.len(),
                    actual: items.len(),
                });
            }
            items.iter().map(json_value_to_input).collect()
        }
        serde_json::Value::Object(map) => {
            let mut ordered = Vec::with_capacity(components.len());
            for component in components {
                let item = map
                    .get(&component.name)
                    .ok_or_else(|| InputError::MissingComponent {
                        name: component.name.clone(),
                    })?;
                ordered.push(json_value_to_input(item));
            }
            ordered
        }
        _ => return Err(InputError::NotATuple),
    };

    let mut validated = Vec::with_capacity(components.len());
    for (index, (text, component)) in ordered.iter().zip(components.iter()).enumerate() {
        let element = validate_input(text, component).map_err(|source| InputError::Element {
            index,
            source: Box::new(source),
        })?;
        validated.push(element);
    }
    Ok(ValidatedValue::Tuple(validated))
}
