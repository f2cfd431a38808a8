//! Command codec: binds schema names to wire bytes and back (spec.md §4.C).
//!
//! `encode` resolves `project[.class].command` against the [`Catalogue`],
//! arity/type-checks the supplied arguments, and packs them little-endian
//! after the `<project_id><class_id><cmd_id>` header. `decode` is the
//! inverse, returning a soft "unknown" for anything not in the catalogue
//! and a hard error only for a malformed-but-recognised payload.

use indexmap::IndexMap;

use crate::schema::{Argument, BufferKind, Catalogue, CommandDef, ListKind, ScalarKind, TimeoutPolicy};

/// One decoded or to-be-encoded command argument value.
///
/// Mirrors [`ScalarKind`] one-to-one. Implements `Hash`/`Eq` (needed as a
/// map-slot key, spec.md §3's `Map{key -> args}`) by comparing floats on
/// their bit pattern — acceptable because map keys are schema `arg0`
/// values, which in practice are never floats, and this still gives a
/// total, consistent order rather than panicking or silently dropping
/// `Eq`.
#[derive(Debug, Clone)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Enum(i32),
    String(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Enum(a), Enum(b)) => a == b,
            (String(a), String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::I8(v) => v.hash(state),
            Value::U8(v) => v.hash(state),
            Value::I16(v) => v.hash(state),
            Value::U16(v) => v.hash(state),
            Value::I32(v) => v.hash(state),
            Value::U32(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::U64(v) => v.hash(state),
            Value::F32(v) => v.to_bits().hash(state),
            Value::F64(v) => v.to_bits().hash(state),
            Value::Enum(v) => v.hash(state),
            Value::String(v) => v.hash(state),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

macro_rules! value_from_int {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

value_from_int!(i8, I8);
value_from_int!(u8, U8);
value_from_int!(i16, I16);
value_from_int!(u16, U16);
value_from_int!(i32, I32);
value_from_int!(u32, U32);
value_from_int!(i64, I64);
value_from_int!(u64, U64);
value_from_int!(f32, F32);
value_from_int!(f64, F64);
value_from_int!(String, String);

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown project {0}")]
    UnknownProject(String),
    #[error("unknown class {class} in project {project}")]
    UnknownClass { project: String, class: String },
    #[error("unknown command {command} in {project}.{class}")]
    UnknownCommand {
        project: String,
        class: String,
        command: String,
    },
    #[error("command {0} expects {expected} arguments, got {actual}")]
    ArityMismatch {
        command: String,
        expected: usize,
        actual: usize,
    },
    #[error("argument {index} ({name}) has the wrong type for command {command}")]
    BadArgumentType {
        command: String,
        name: String,
        index: usize,
    },
    #[error("payload too short: need {needed} bytes, have {available}")]
    TruncatedPayload { needed: usize, available: usize },
    #[error("no NUL terminator found for string argument {name}")]
    MissingNulTerminator { name: String },
}

/// A successfully decoded command, ready to be routed into the device
/// state store by its `list_kind` (spec.md §4.E).
#[derive(Debug, Clone, Default)]
pub struct DecodedCommand {
    pub project: String,
    pub class: String,
    pub command: String,
    pub list_kind: Option<ListKind>,
    pub args: IndexMap<String, Value>,
    pub arg0: Option<Value>,
}

/// Binds a [`Catalogue`] to the pack/unpack operations in spec.md §4.C.
pub struct Codec {
    catalogue: std::sync::Arc<Catalogue>,
}

impl Codec {
    pub fn new(catalogue: std::sync::Arc<Catalogue>) -> Self {
        Self { catalogue }
    }

    /// Resolves `project[.class].command`, arity/type-checks `args`, and
    /// packs the wire payload. Returns the schema's recommended buffer
    /// kind and timeout policy alongside the bytes, as hints for the
    /// orchestrator (spec.md §4.C).
    pub fn encode(
        &self,
        project: &str,
        class: &str,
        command: &str,
        args: &[Value],
    ) -> Result<(Vec<u8>, BufferKind, TimeoutPolicy), CodecError> {
        let is_feature = self
            .catalogue
            .is_feature(project)
            .ok_or_else(|| CodecError::UnknownProject(project.to_owned()))?;

        let lookup_class = if is_feature { "" } else { class };

        if !is_feature && !self.catalogue.has_class(project, class) {
            return Err(CodecError::UnknownClass {
                project: project.to_owned(),
                class: class.to_owned(),
            });
        }

        let def = self
            .catalogue
            .find_by_name(project, lookup_class, command)
            .ok_or_else(|| CodecError::UnknownCommand {
                project: project.to_owned(),
                class: class.to_owned(),
                command: command.to_owned(),
            })?;

        if args.len() != def.args.len() {
            return Err(CodecError::ArityMismatch {
                command: command.to_owned(),
                expected: def.args.len(),
                actual: args.len(),
            });
        }

        let mut out = Vec::new();
        out.push(def.project_id);
        out.push(def.class_id);
        out.extend_from_slice(&def.cmd_id.to_le_bytes());

        for (index, (arg, value)) in def.args.iter().zip(args).enumerate() {
            encode_one(&mut out, arg, value, command, index)?;
        }

        Ok((out, def.buffer_kind, def.timeout_policy.clone()))
    }

    /// Parses the 4-byte header, resolves the command against both the
    /// project and feature id tables (they share the `u8` project-id
    /// namespace on the wire), and decodes its arguments. An unrecognised
    /// header is a soft miss (`Ok((_, false))`); a recognised-but-malformed
    /// payload is a hard [`CodecError`].
    pub fn decode(&self, bytes: &[u8]) -> Result<(DecodedCommand, bool), CodecError> {
        if bytes.len() < 4 {
            return Err(CodecError::TruncatedPayload {
                needed: 4,
                available: bytes.len(),
            });
        }

        let project_id = bytes[0];
        let class_id = bytes[1];
        let cmd_id = u16::from_le_bytes([bytes[2], bytes[3]]);

        let def = self
            .catalogue
            .find_project_by_id(project_id, class_id, cmd_id)
            .or_else(|| self.catalogue.find_feature_by_id(project_id, cmd_id));

        let Some(def) = def else {
            return Ok((DecodedCommand::default(), false));
        };

        let (args, arg0) = decode_args(&bytes[4..], def)?;

        Ok((
            DecodedCommand {
                project: def.project_name.clone(),
                class: def.class_name.clone(),
                command: def.cmd_name.clone(),
                list_kind: Some(def.list_kind),
                args,
                arg0,
            },
            true,
        ))
    }
}

fn encode_one(
    out: &mut Vec<u8>,
    arg: &Argument,
    value: &Value,
    command: &str,
    index: usize,
) -> Result<(), CodecError> {
    let mismatch = || CodecError::BadArgumentType {
        command: command.to_owned(),
        name: arg.name.clone(),
        index,
    };

    match (arg.kind, value) {
        (ScalarKind::I8, Value::I8(v)) => out.push(*v as u8),
        (ScalarKind::U8, Value::U8(v)) => out.push(*v),
        (ScalarKind::I16, Value::I16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::U16, Value::U16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::I32, Value::I32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::U32, Value::U32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::I64, Value::I64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::U64, Value::U64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::F32, Value::F32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::F64, Value::F64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::Enum, Value::Enum(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (ScalarKind::String, Value::String(v)) => {
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        _ => return Err(mismatch()),
    }

    Ok(())
}

fn decode_args(
    mut bytes: &[u8],
    def: &CommandDef,
) -> Result<(IndexMap<String, Value>, Option<Value>), CodecError> {
    let mut args = IndexMap::new();
    let mut arg0 = None;

    for (index, arg) in def.args.iter().enumerate() {
        let value = decode_one(&mut bytes, arg)?;
        if index == 0 {
            arg0 = Some(value.clone());
        }
        args.insert(arg.name.clone(), value);
    }

    Ok((args, arg0))
}

fn decode_one(bytes: &mut &[u8], arg: &Argument) -> Result<Value, CodecError> {
    fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
        if bytes.len() < n {
            return Err(CodecError::TruncatedPayload {
                needed: n,
                available: bytes.len(),
            });
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    }

    Ok(match arg.kind {
        ScalarKind::I8 => Value::I8(take(bytes, 1)?[0] as i8),
        ScalarKind::U8 => Value::U8(take(bytes, 1)?[0]),
        ScalarKind::I16 => Value::I16(i16::from_le_bytes(take(bytes, 2)?.try_into().unwrap())),
        ScalarKind::U16 => Value::U16(u16::from_le_bytes(take(bytes, 2)?.try_into().unwrap())),
        ScalarKind::I32 => Value::I32(i32::from_le_bytes(take(bytes, 4)?.try_into().unwrap())),
        ScalarKind::U32 => Value::U32(u32::from_le_bytes(take(bytes, 4)?.try_into().unwrap())),
        ScalarKind::I64 => Value::I64(i64::from_le_bytes(take(bytes, 8)?.try_into().unwrap())),
        ScalarKind::U64 => Value::U64(u64::from_le_bytes(take(bytes, 8)?.try_into().unwrap())),
        ScalarKind::F32 => Value::F32(f32::from_le_bytes(take(bytes, 4)?.try_into().unwrap())),
        ScalarKind::F64 => Value::F64(f64::from_le_bytes(take(bytes, 8)?.try_into().unwrap())),
        ScalarKind::Enum => Value::Enum(i32::from_le_bytes(take(bytes, 4)?.try_into().unwrap())),
        ScalarKind::String => {
            let nul_at = bytes.iter().position(|&b| b == 0).ok_or_else(|| {
                CodecError::MissingNulTerminator {
                    name: arg.name.clone(),
                }
            })?;
            let raw = take(bytes, nul_at)?;
            let s = String::from_utf8_lossy(raw).into_owned();
            let _ = take(bytes, 1)?; // consume the NUL itself
            Value::String(s)
        }
    })
}
