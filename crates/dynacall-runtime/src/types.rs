//! Signature and value model for the FFI boundary
//!
//! Defines:
//! - `ParamKind` / `ReturnKind`: the native kind of one argument or result
//! - `StructLayout` / `FieldKind`: C aggregate layouts
//! - `Signature`: an ordered parameter list plus an optional return kind
//! - `Value`: host-side values crossing the boundary
//!
//! Kinds are plain data: they are built once, compared structurally and used
//! as cache keys.

use crate::caller::Callable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Width of a native integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    /// Width in bits
    pub const fn bits(self) -> u32 {
        match self {
            IntWidth::W8 => 8,
            IntWidth::W16 => 16,
            IntWidth::W32 => 32,
            IntWidth::W64 => 64,
        }
    }

    /// Width in bytes
    pub const fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Width for a bit count, if it is one of 8/16/32/64
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(IntWidth::W8),
            16 => Some(IntWidth::W16),
            32 => Some(IntWidth::W32),
            64 => Some(IntWidth::W64),
            _ => None,
        }
    }
}

/// A leaf field of a struct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Int(IntWidth),
    UInt(IntWidth),
    Bool,
    Pointer,
    F32,
    F64,
}

impl ScalarKind {
    pub const I8: ScalarKind = ScalarKind::Int(IntWidth::W8);
    pub const I16: ScalarKind = ScalarKind::Int(IntWidth::W16);
    pub const I32: ScalarKind = ScalarKind::Int(IntWidth::W32);
    pub const I64: ScalarKind = ScalarKind::Int(IntWidth::W64);
    pub const U8: ScalarKind = ScalarKind::UInt(IntWidth::W8);
    pub const U16: ScalarKind = ScalarKind::UInt(IntWidth::W16);
    pub const U32: ScalarKind = ScalarKind::UInt(IntWidth::W32);
    pub const U64: ScalarKind = ScalarKind::UInt(IntWidth::W64);

    /// Size (and natural alignment) in bytes
    pub const fn size(self) -> usize {
        match self {
            ScalarKind::Int(w) | ScalarKind::UInt(w) => w.bytes(),
            ScalarKind::Bool => 1,
            ScalarKind::Pointer => std::mem::size_of::<usize>(),
            ScalarKind::F32 => 4,
            ScalarKind::F64 => 8,
        }
    }

    /// Whether the scalar belongs to the floating-point register class
    pub const fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }
}

/// One field of a `StructLayout`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Scalar(ScalarKind),
    Struct(StructLayout),
    /// Fixed-length inline array
    Array(Box<FieldKind>, usize),
}

impl From<ScalarKind> for FieldKind {
    fn from(scalar: ScalarKind) -> Self {
        FieldKind::Scalar(scalar)
    }
}

impl From<StructLayout> for FieldKind {
    fn from(layout: StructLayout) -> Self {
        FieldKind::Struct(layout)
    }
}

impl FieldKind {
    /// Inline array of `len` elements
    pub fn array(element: impl Into<FieldKind>, len: usize) -> Self {
        FieldKind::Array(Box::new(element.into()), len)
    }

    pub fn size(&self) -> usize {
        match self {
            FieldKind::Scalar(s) => s.size(),
            FieldKind::Struct(layout) => layout.size(),
            FieldKind::Array(element, len) => element.size() * len,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            FieldKind::Scalar(s) => s.size(),
            FieldKind::Struct(layout) => layout.align(),
            FieldKind::Array(element, _) => element.align(),
        }
    }

    fn collect_scalars(&self, base: usize, out: &mut Vec<(usize, ScalarKind)>) {
        match self {
            FieldKind::Scalar(s) => out.push((base, *s)),
            FieldKind::Struct(layout) => {
                for (field, offset) in layout.fields.iter().zip(&layout.offsets) {
                    field.collect_scalars(base + offset, out);
                }
            }
            FieldKind::Array(element, len) => {
                let stride = element.size();
                for i in 0..*len {
                    element.collect_scalars(base + i * stride, out);
                }
            }
        }
    }
}

/// C layout of an aggregate
///
/// Offsets, size and alignment follow the C rules: every field sits at its
/// natural alignment and the total size is rounded up to the struct's
/// alignment. An empty struct has size 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructLayout {
    fields: Vec<FieldKind>,
    offsets: Vec<usize>,
    size: usize,
    align: usize,
}

impl StructLayout {
    pub fn new(fields: Vec<FieldKind>) -> Self {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = 0;
        let mut align = 1;

        for field in &fields {
            let field_align = field.align();
            offset = align_up(offset, field_align);
            offsets.push(offset);
            offset += field.size();
            align = align.max(field_align);
        }

        Self {
            fields,
            offsets,
            size: align_up(offset, align),
            align,
        }
    }

    /// Layout of a struct whose fields are all scalars
    pub fn of_scalars(fields: &[ScalarKind]) -> Self {
        Self::new(fields.iter().copied().map(FieldKind::Scalar).collect())
    }

    pub fn fields(&self) -> &[FieldKind] {
        &self.fields
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Every scalar leaf with its byte offset, in memory order
    ///
    /// Nested structs and arrays are flattened.
    pub fn scalars(&self) -> Vec<(usize, ScalarKind)> {
        let mut out = Vec::new();
        for (field, offset) in self.fields.iter().zip(&self.offsets) {
            field.collect_scalars(*offset, &mut out);
        }
        out
    }

    /// Whether any leaf is a pointer
    pub fn has_pointer(&self) -> bool {
        self.scalars()
            .iter()
            .any(|(_, s)| matches!(s, ScalarKind::Pointer))
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Native kind of one parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    Int(IntWidth),
    UInt(IntWidth),
    Pointer,
    Bool,
    F32,
    F64,
    /// NUL-terminated byte string
    NativeString,
    /// Aggregate passed by value
    Struct(StructLayout),
    /// Function pointer with the given signature
    Callback(Signature),
}

/// Return kinds share the parameter variants; `None` means void
pub type ReturnKind = ParamKind;

impl ParamKind {
    pub const I8: ParamKind = ParamKind::Int(IntWidth::W8);
    pub const I16: ParamKind = ParamKind::Int(IntWidth::W16);
    pub const I32: ParamKind = ParamKind::Int(IntWidth::W32);
    pub const I64: ParamKind = ParamKind::Int(IntWidth::W64);
    pub const U8: ParamKind = ParamKind::UInt(IntWidth::W8);
    pub const U16: ParamKind = ParamKind::UInt(IntWidth::W16);
    pub const U32: ParamKind = ParamKind::UInt(IntWidth::W32);
    pub const U64: ParamKind = ParamKind::UInt(IntWidth::W64);

    /// Whether the kind travels in a floating-point register
    pub fn is_float(&self) -> bool {
        matches!(self, ParamKind::F32 | ParamKind::F64)
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Int(w) => write!(f, "i{}", w.bits()),
            ParamKind::UInt(w) => write!(f, "u{}", w.bits()),
            ParamKind::Pointer => write!(f, "ptr"),
            ParamKind::Bool => write!(f, "bool"),
            ParamKind::F32 => write!(f, "f32"),
            ParamKind::F64 => write!(f, "f64"),
            ParamKind::NativeString => write!(f, "str"),
            ParamKind::Struct(layout) => {
                write!(f, "struct({} bytes, {} fields)", layout.size(), layout.fields().len())
            }
            ParamKind::Callback(sig) => write!(f, "fn{}", sig),
        }
    }
}

/// Parses the scalar kind names `i8 .. i64`, `u8 .. u64`, `bool`, `ptr`,
/// `f32`, `f64` and `str`
impl FromStr for ParamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "ptr" | "pointer" => return Ok(ParamKind::Pointer),
            "bool" => return Ok(ParamKind::Bool),
            "f32" => return Ok(ParamKind::F32),
            "f64" => return Ok(ParamKind::F64),
            "str" | "string" => return Ok(ParamKind::NativeString),
            _ => {}
        }

        let width = |digits: &str| {
            digits
                .parse::<u32>()
                .ok()
                .and_then(IntWidth::from_bits)
                .ok_or_else(|| format!("unknown kind '{}'", s))
        };
        if let Some(bits) = s.strip_prefix('i') {
            return Ok(ParamKind::Int(width(bits)?));
        }
        if let Some(bits) = s.strip_prefix('u') {
            return Ok(ParamKind::UInt(width(bits)?));
        }
        Err(format!("unknown kind '{}'", s))
    }
}

/// Ordered parameter kinds plus an optional return kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    params: Vec<ParamKind>,
    ret: Option<Box<ReturnKind>>,
}

impl Signature {
    pub fn new(params: Vec<ParamKind>, ret: Option<ReturnKind>) -> Self {
        Self {
            params,
            ret: ret.map(Box::new),
        }
    }

    /// Void signature with the given parameters; chain `returns` for a result
    pub fn of(params: impl IntoIterator<Item = ParamKind>) -> Self {
        Self::new(params.into_iter().collect(), None)
    }

    pub fn returns(mut self, ret: ReturnKind) -> Self {
        self.ret = Some(Box::new(ret));
        self
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn ret(&self) -> Option<&ReturnKind> {
        self.ret.as_deref()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ")")?;
        match self.ret() {
            Some(ret) => write!(f, " -> {}", ret),
            None => write!(f, " -> void"),
        }
    }
}

/// Host function callable from native code
pub type HostFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Host-side value crossing the boundary
#[derive(Clone)]
pub enum Value {
    Void,
    Int(i64),
    UInt(u64),
    Bool(bool),
    F32(f32),
    F64(f64),
    Pointer(usize),
    String(String),
    Struct(Vec<Value>),
    Array(Vec<Value>),
    /// Host function to expose as a native function pointer
    Callback(HostFn),
    /// Native function bound to a signature
    Function(Callable),
}

impl Value {
    /// Wrap a closure as a callback value
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Value::Callback(Arc::new(f))
    }

    /// Short name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Bool(_) => "bool",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Pointer(_) => "pointer",
            Value::String(_) => "string",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Callback(_) => "callback",
            Value::Function(_) => "function",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "Void"),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::UInt(v) => write!(f, "UInt({})", v),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::F32(v) => write!(f, "F32({:?})", v),
            Value::F64(v) => write!(f, "F64({:?})", v),
            Value::Pointer(p) => write!(f, "Pointer({:#x})", p),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Struct(fields) => f.debug_tuple("Struct").field(fields).finish(),
            Value::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Value::Callback(host) => write!(f, "Callback({:p})", Arc::as_ptr(host)),
            Value::Function(callable) => write!(
                f,
                "Function({:#x}, {})",
                callable.address(),
                callable.signature()
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Pointer(p) => write!(f, "{:#x}", p),
            Value::String(s) => write!(f, "{}", s),
            Value::Struct(items) | Value::Array(items) => {
                let open = if matches!(self, Value::Struct(_)) { '{' } else { '[' };
                let close = if open == '{' { '}' } else { ']' };
                write!(f, "{}", open)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "{}", close)
            }
            Value::Callback(_) => write!(f, "<callback>"),
            Value::Function(callable) => write!(f, "<fn {:#x}>", callable.address()),
        }
    }
}

// Manual PartialEq: host functions compare by identity
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Callback(a), Value::Callback(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => {
                a.address() == b.address() && a.signature() == b.signature()
            }
            _ => false,
        }
    }
}
