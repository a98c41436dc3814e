//! Value marshaling - host ↔ native conversions
//!
//! Provides:
//! - `KeepAlive`: buffers that must outlive one native call
//! - string conversion in both directions
//! - scalar encoding into raw 64-bit slots and decoding back
//! - struct images laid out at their C field offsets
//!
//! # Memory Safety
//!
//! - Every converted string and by-reference struct copy is owned by the
//!   call's `KeepAlive`, which is released only after the native call returns
//! - Native strings are copied, never freed
//! - Integer values are range checked against the target width

use crate::caller::Callable;
use crate::callbacks;
use crate::error::{FfiError, FfiResult};
use crate::types::{FieldKind, IntWidth, ParamKind, ScalarKind, StructLayout, Value};
use std::ffi::CStr;
use std::os::raw::c_char;

/// Buffers kept alive for the duration of one native call
///
/// Heap buffers do not move when the owning `Vec` grows, so addresses handed
/// out stay valid until `release` (or drop).
#[derive(Debug, Default)]
pub struct KeepAlive {
    strings: Vec<Vec<u8>>,
    blocks: Vec<Vec<u64>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a byte buffer and return its address
    pub fn hold_bytes(&mut self, bytes: Vec<u8>) -> usize {
        let address = bytes.as_ptr() as usize;
        self.strings.push(bytes);
        address
    }

    /// Take ownership of an 8-byte aligned block and return its address
    pub fn hold_block(&mut self, words: Vec<u64>) -> usize {
        let address = words.as_ptr() as usize;
        self.blocks.push(words);
        address
    }

    /// Number of buffers held
    pub fn len(&self) -> usize {
        self.strings.len() + self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End the liveness of every held buffer
    ///
    /// Called by the invoker once the native call has returned.
    pub fn release(self) {
        drop(self);
    }
}

/// Pass a host string to native code as a NUL-terminated buffer
///
/// A string that already ends in NUL is passed as is; otherwise a copy with
/// one trailing zero byte is registered in `keep`. Interior NUL bytes are
/// not rejected: native code simply sees a shorter string.
pub fn str_to_native(s: &str, keep: &mut KeepAlive) -> usize {
    if s.as_bytes().last() == Some(&0) {
        return s.as_ptr() as usize;
    }
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    keep.hold_bytes(bytes)
}

/// Copy a NUL-terminated native string into a host string
///
/// NULL yields an empty string. Invalid UTF-8 is replaced lossily.
///
/// # Safety
///
/// `address` must be 0 or point to a readable NUL-terminated buffer.
pub unsafe fn str_from_native(address: usize) -> String {
    if address == 0 {
        return String::new();
    }
    CStr::from_ptr(address as *const c_char)
        .to_string_lossy()
        .into_owned()
}

/// Scalar class of a parameter kind, if it has one
pub(crate) fn scalar_of(kind: &ParamKind) -> Option<ScalarKind> {
    match kind {
        ParamKind::Int(w) => Some(ScalarKind::Int(*w)),
        ParamKind::UInt(w) => Some(ScalarKind::UInt(*w)),
        ParamKind::Pointer | ParamKind::NativeString | ParamKind::Callback(_) => {
            Some(ScalarKind::Pointer)
        }
        ParamKind::Bool => Some(ScalarKind::Bool),
        ParamKind::F32 => Some(ScalarKind::F32),
        ParamKind::F64 => Some(ScalarKind::F64),
        ParamKind::Struct(_) => None,
    }
}

fn mismatch(expected: impl ToString, got: &Value) -> FfiError {
    FfiError::TypeMismatch {
        expected: expected.to_string(),
        got: got.type_name().to_string(),
    }
}

/// Range-check an integer value and return it extended to 64 bits
///
/// Signed targets are sign-extended, unsigned targets zero-extended.
pub fn coerce_int(value: &Value, width: IntWidth, signed: bool) -> FfiResult<u64> {
    let bits = width.bits();
    let target = format!("{}{}", if signed { 'i' } else { 'u' }, bits);

    let (min, max) = if signed {
        let max = (i64::MAX >> (64 - bits)) as i128;
        (-max - 1, max)
    } else {
        (0, (u64::MAX >> (64 - bits)) as i128)
    };

    let wide = match value {
        Value::Int(v) => *v as i128,
        Value::UInt(v) => *v as i128,
        other => return Err(mismatch(&target, other)),
    };
    if wide < min || wide > max {
        return Err(FfiError::OutOfRange {
            value: value.to_string(),
            target,
        });
    }

    Ok(if signed {
        wide as i64 as u64
    } else {
        wide as u64
    })
}

/// Encode a scalar value into the bits of one 64-bit slot
pub fn encode_scalar(scalar: ScalarKind, value: &Value) -> FfiResult<u64> {
    match scalar {
        ScalarKind::Int(w) => coerce_int(value, w, true),
        ScalarKind::UInt(w) => coerce_int(value, w, false),
        ScalarKind::Bool => match value {
            Value::Bool(b) => Ok(*b as u64),
            other => Err(mismatch("bool", other)),
        },
        ScalarKind::Pointer => match value {
            Value::Pointer(p) => Ok(*p as u64),
            Value::UInt(u) => Ok(*u),
            Value::Function(callable) => Ok(callable.address() as u64),
            other => Err(mismatch("pointer", other)),
        },
        ScalarKind::F32 => match value {
            Value::F32(f) => Ok(f.to_bits() as u64),
            Value::F64(d) => Ok((*d as f32).to_bits() as u64),
            other => Err(mismatch("f32", other)),
        },
        ScalarKind::F64 => match value {
            Value::F64(d) => Ok(d.to_bits()),
            Value::F32(f) => Ok((*f as f64).to_bits()),
            other => Err(mismatch("f64", other)),
        },
    }
}

/// Decode the low bits of a slot as a scalar
pub fn decode_scalar(scalar: ScalarKind, bits: u64) -> Value {
    match scalar {
        ScalarKind::Int(w) => {
            let shift = 64 - w.bits();
            Value::Int(((bits << shift) as i64) >> shift)
        }
        ScalarKind::UInt(w) => Value::UInt(bits & (u64::MAX >> (64 - w.bits()))),
        ScalarKind::Bool => Value::Bool(bits as u8 != 0),
        ScalarKind::Pointer => Value::Pointer(bits as usize),
        ScalarKind::F32 => Value::F32(f32::from_bits(bits as u32)),
        ScalarKind::F64 => Value::F64(f64::from_bits(bits)),
    }
}

/// Encode one scalar-placed argument into the bits of its slot
///
/// Strings are converted into `keep`; host callbacks are bridged into a
/// native function pointer.
pub(crate) fn encode_param(kind: &ParamKind, value: &Value, keep: &mut KeepAlive) -> FfiResult<u64> {
    match (kind, value) {
        (ParamKind::NativeString, Value::String(s)) => Ok(str_to_native(s, keep) as u64),
        (ParamKind::NativeString, Value::Pointer(p)) => Ok(*p as u64),
        (ParamKind::NativeString, other) => Err(mismatch("string", other)),
        (ParamKind::Callback(sig), Value::Callback(host)) => {
            Ok(callbacks::bridge_host_fn(sig, host)? as u64)
        }
        (ParamKind::Callback(_), Value::Function(callable)) => Ok(callable.address() as u64),
        (ParamKind::Callback(_), Value::Pointer(p)) => Ok(*p as u64),
        (ParamKind::Callback(sig), other) => Err(mismatch(format!("callback {}", sig), other)),
        (kind, value) => match scalar_of(kind) {
            Some(scalar) => encode_scalar(scalar, value),
            None => Err(FfiError::UnsupportedKind(format!("{} in a single slot", kind))),
        },
    }
}

/// Decode one scalar-placed argument or return value from its slot bits
///
/// Native strings are copied; non-null function pointers come back bound to
/// their declared signature.
pub(crate) fn decode_param(kind: &ParamKind, bits: u64) -> Value {
    match kind {
        // Safety: a string slot holds NULL or a NUL-terminated buffer
        ParamKind::NativeString => Value::String(unsafe { str_from_native(bits as usize) }),
        ParamKind::Callback(_) if bits == 0 => Value::Pointer(0),
        // Safety: the declared signature is the contract for this pointer
        ParamKind::Callback(sig) => unsafe { Callable::bind(bits as usize, sig.clone()) }
            .map(Value::Function)
            .unwrap_or(Value::Pointer(bits as usize)),
        kind => match scalar_of(kind) {
            Some(scalar) => decode_scalar(scalar, bits),
            None => Value::Void,
        },
    }
}

/// Byte image of a struct laid out at its C offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructImage {
    bytes: Vec<u8>,
}

impl StructImage {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The image as 8-byte words, zero padded at the end
    pub fn into_words(self) -> Vec<u64> {
        self.bytes
            .chunks(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word[..chunk.len()].copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect()
    }
}

/// Lay a `Value::Struct` out in memory following `layout`
pub fn pack_struct(layout: &StructLayout, value: &Value) -> FfiResult<StructImage> {
    let mut bytes = vec![0u8; layout.size()];
    pack_fields(layout, value, &mut bytes, 0)?;
    Ok(StructImage { bytes })
}

fn pack_fields(layout: &StructLayout, value: &Value, out: &mut [u8], base: usize) -> FfiResult<()> {
    let fields = match value {
        Value::Struct(fields) => fields,
        other => return Err(mismatch("struct", other)),
    };
    if fields.len() != layout.fields().len() {
        return Err(FfiError::TypeMismatch {
            expected: format!("struct with {} fields", layout.fields().len()),
            got: format!("struct with {} fields", fields.len()),
        });
    }
    for ((kind, offset), field) in layout.fields().iter().zip(layout.offsets()).zip(fields) {
        pack_field(kind, field, out, base + offset)?;
    }
    Ok(())
}

fn pack_field(kind: &FieldKind, value: &Value, out: &mut [u8], at: usize) -> FfiResult<()> {
    match kind {
        FieldKind::Scalar(scalar) => {
            let bits = encode_scalar(*scalar, value)?;
            let size = scalar.size();
            out[at..at + size].copy_from_slice(&bits.to_le_bytes()[..size]);
            Ok(())
        }
        FieldKind::Struct(layout) => pack_fields(layout, value, out, at),
        FieldKind::Array(element, len) => {
            let items = match value {
                Value::Array(items) => items,
                other => return Err(mismatch("array", other)),
            };
            if items.len() != *len {
                return Err(FfiError::TypeMismatch {
                    expected: format!("array of {}", len),
                    got: format!("array of {}", items.len()),
                });
            }
            let stride = element.size();
            for (i, item) in items.iter().enumerate() {
                pack_field(element, item, out, at + i * stride)?;
            }
            Ok(())
        }
    }
}

/// Rebuild a `Value::Struct` from its memory image
///
/// Bytes past the end of `bytes` read as zero.
pub fn unpack_struct(layout: &StructLayout, bytes: &[u8]) -> Value {
    unpack_fields(layout, bytes, 0)
}

fn unpack_fields(layout: &StructLayout, bytes: &[u8], base: usize) -> Value {
    Value::Struct(
        layout
            .fields()
            .iter()
            .zip(layout.offsets())
            .map(|(kind, offset)| unpack_field(kind, bytes, base + offset))
            .collect(),
    )
}

fn unpack_field(kind: &FieldKind, bytes: &[u8], at: usize) -> Value {
    match kind {
        FieldKind::Scalar(scalar) => {
            let mut word = [0u8; 8];
            for (i, slot) in word.iter_mut().take(scalar.size()).enumerate() {
                *slot = bytes.get(at + i).copied().unwrap_or(0);
            }
            decode_scalar(*scalar, u64::from_le_bytes(word))
        }
        FieldKind::Struct(layout) => unpack_fields(layout, bytes, at),
        FieldKind::Array(element, len) => {
            let stride = element.size();
            Value::Array(
                (0..*len)
                    .map(|i| unpack_field(element, bytes, at + i * stride))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_str_to_native_appends_nul() {
        let mut keep = KeepAlive::new();
        let address = str_to_native("hello", &mut keep);
        assert_eq!(keep.len(), 1);
        assert_eq!(unsafe { str_from_native(address) }, "hello");
    }

    #[test]
    fn test_str_to_native_reuses_terminated_buffer() {
        let mut keep = KeepAlive::new();
        let s = String::from("done\0");
        let address = str_to_native(&s, &mut keep);
        assert_eq!(address, s.as_ptr() as usize);
        assert!(keep.is_empty());
    }

    #[test]
    fn test_str_to_native_interior_nul_passes_through() {
        let mut keep = KeepAlive::new();
        let address = str_to_native("ab\0cd", &mut keep);
        assert_eq!(unsafe { str_from_native(address) }, "ab");
    }

    #[test]
    fn test_str_from_native_null_is_empty() {
        assert_eq!(unsafe { str_from_native(0) }, "");
    }

    #[test]
    fn test_str_from_native_lossy() {
        let bytes = [b'o', b'k', 0xff, 0];
        let text = unsafe { str_from_native(bytes.as_ptr() as usize) };
        assert_eq!(text, "ok\u{fffd}");
    }

    #[rstest]
    #[case(Value::Int(-128), IntWidth::W8, true, (-128i64) as u64)]
    #[case(Value::Int(127), IntWidth::W8, true, 127)]
    #[case(Value::UInt(255), IntWidth::W8, false, 255)]
    #[case(Value::Int(65535), IntWidth::W16, false, 65535)]
    #[case(Value::UInt(u64::MAX), IntWidth::W64, false, u64::MAX)]
    #[case(Value::Int(i64::MIN), IntWidth::W64, true, i64::MIN as u64)]
    fn test_coerce_int_in_range(
        #[case] value: Value,
        #[case] width: IntWidth,
        #[case] signed: bool,
        #[case] expected: u64,
    ) {
        assert_eq!(coerce_int(&value, width, signed).unwrap(), expected);
    }

    #[rstest]
    #[case(Value::Int(128), IntWidth::W8, true)]
    #[case(Value::Int(-1), IntWidth::W32, false)]
    #[case(Value::UInt(1 << 31), IntWidth::W32, true)]
    #[case(Value::UInt(u64::MAX), IntWidth::W64, true)]
    fn test_coerce_int_out_of_range(
        #[case] value: Value,
        #[case] width: IntWidth,
        #[case] signed: bool,
    ) {
        assert!(matches!(
            coerce_int(&value, width, signed),
            Err(FfiError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_encode_type_mismatch() {
        let result = encode_scalar(ScalarKind::I32, &Value::String("1".into()));
        assert!(matches!(result, Err(FfiError::TypeMismatch { .. })));
        let result = encode_scalar(ScalarKind::Bool, &Value::Int(1));
        assert!(matches!(result, Err(FfiError::TypeMismatch { .. })));
    }

    #[rstest]
    #[case(ScalarKind::I8, 0xff, Value::Int(-1))]
    #[case(ScalarKind::U8, 0x1ff, Value::UInt(0xff))]
    #[case(ScalarKind::I16, 0x8000, Value::Int(-32768))]
    #[case(ScalarKind::I32, 0xdead_beef_0000_0005, Value::Int(5))]
    #[case(ScalarKind::Bool, 0x100, Value::Bool(false))]
    #[case(ScalarKind::Bool, 0x2, Value::Bool(true))]
    #[case(ScalarKind::F32, 0xffff_ffff_3fc0_0000, Value::F32(1.5))]
    fn test_decode_scalar(#[case] scalar: ScalarKind, #[case] bits: u64, #[case] expected: Value) {
        assert_eq!(decode_scalar(scalar, bits), expected);
    }

    #[test]
    fn test_pack_struct_offsets() {
        // struct { u8 a; u32 b; }
        let layout = StructLayout::of_scalars(&[ScalarKind::U8, ScalarKind::U32]);
        let image = pack_struct(
            &layout,
            &Value::Struct(vec![Value::UInt(7), Value::UInt(0x0102_0304)]),
        )
        .unwrap();
        assert_eq!(image.bytes(), &[7, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(image.into_words(), vec![0x0102_0304_0000_0007]);
    }

    #[test]
    fn test_pack_unpack_nested() {
        let point = StructLayout::of_scalars(&[ScalarKind::F32, ScalarKind::F32]);
        let layout = StructLayout::new(vec![
            FieldKind::Struct(point),
            FieldKind::array(ScalarKind::I16, 2),
            ScalarKind::Bool.into(),
        ]);
        let value = Value::Struct(vec![
            Value::Struct(vec![Value::F32(1.0), Value::F32(-2.5)]),
            Value::Array(vec![Value::Int(-3), Value::Int(4)]),
            Value::Bool(true),
        ]);
        let image = pack_struct(&layout, &value).unwrap();
        assert_eq!(image.size(), layout.size());
        assert_eq!(unpack_struct(&layout, image.bytes()), value);
    }

    #[test]
    fn test_pack_struct_wrong_field_count() {
        let layout = StructLayout::of_scalars(&[ScalarKind::U8, ScalarKind::U8]);
        let result = pack_struct(&layout, &Value::Struct(vec![Value::UInt(1)]));
        assert!(matches!(result, Err(FfiError::TypeMismatch { .. })));
    }

    #[test]
    fn test_keep_alive_addresses_stable() {
        let mut keep = KeepAlive::new();
        let first = keep.hold_block(vec![42]);
        for i in 0..64 {
            keep.hold_block(vec![i]);
        }
        assert_eq!(unsafe { *(first as *const u64) }, 42);
        assert_eq!(keep.len(), 65);
        keep.release();
    }
}
