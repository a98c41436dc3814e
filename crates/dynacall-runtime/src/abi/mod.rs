//! ABI classification - where every argument travels
//!
//! A `CallPlan` is computed once per signature and decides, for each
//! argument, whether it occupies an integer register, a float register or
//! overflow stack words. Invocations then fill a fresh `CallImage` from the
//! plan, and the callback bridge reads values back out of one.
//!
//! The raw call itself always passes the complete register files followed by
//! the stack words (see `CallPlan::lowering`), so the physical placement is
//! decided here and nowhere else.
//!
//! All three conventions are compiled on every target; `Convention::host`
//! selects the one native code on this build actually uses.

pub mod aapcs64;
pub mod sysv;
pub mod win64;

use crate::error::{FfiError, FfiResult};
use crate::marshal::{self, pack_struct, unpack_struct, KeepAlive};
use crate::types::{ParamKind, ReturnKind, Signature, StructLayout, Value};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Upper bound on argument slots (registers plus stack words) per call
pub const MAX_ARGS: usize = 15;

/// Capacity of the integer register file in a `CallImage`
pub const MAX_INT_REGISTERS: usize = 8;

/// Capacity of the float register file in a `CallImage`
pub const MAX_FLOAT_REGISTERS: usize = 8;

/// A native calling convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    /// System V AMD64 (Linux, macOS, BSD on x86_64)
    SysV,
    /// Procedure Call Standard for the Arm 64-bit Architecture
    Aapcs64,
    /// Microsoft x64
    Win64,
}

impl Convention {
    /// Convention of the build target
    pub const fn host() -> Convention {
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        {
            Convention::SysV
        }
        #[cfg(all(target_arch = "x86_64", windows))]
        {
            Convention::Win64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Convention::Aapcs64
        }
    }

    /// Integer argument registers
    pub const fn int_registers(self) -> usize {
        match self {
            Convention::SysV => 6,
            Convention::Aapcs64 => 8,
            Convention::Win64 => 4,
        }
    }

    /// Floating-point argument registers
    pub const fn float_registers(self) -> usize {
        match self {
            Convention::SysV | Convention::Aapcs64 => 8,
            Convention::Win64 => 4,
        }
    }

    /// Stack words a call may use before `TooManyArguments`
    pub const fn max_stack_slots(self) -> usize {
        MAX_ARGS - self.int_registers()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Convention::SysV => "sysv",
            Convention::Aapcs64 => "aapcs64",
            Convention::Win64 => "win64",
        }
    }
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Convention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sysv" | "x86_64" | "amd64" => Ok(Convention::SysV),
            "aapcs64" | "arm64" | "aarch64" => Ok(Convention::Aapcs64),
            "win64" | "windows" => Ok(Convention::Win64),
            other => Err(format!("unknown calling convention '{}'", other)),
        }
    }
}

/// One physical argument slot
///
/// Win64 indexes registers by argument position, so `Int(2)` there is the
/// third argument register regardless of how many floats precede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Location {
    Int(usize),
    Float(usize),
    Stack(usize),
}

/// Entry of the raw argument list handed to the trampoline library
pub type RawSlot = Location;

/// A byte range of an aggregate carried by one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Piece {
    pub offset: usize,
    pub size: usize,
    pub loc: Location,
}

/// Where one argument goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Placement {
    /// A scalar in a single slot
    Scalar(Location),
    /// An aggregate split across slots; pieces cover the struct in order
    Pieces(Vec<Piece>),
    /// An aggregate copied to memory and passed by address in this slot
    Indirect(Location),
    /// A zero-sized aggregate; occupies nothing
    Empty,
}

/// Register class of the return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReturnClass {
    Void,
    Int,
    F32,
    F64,
}

impl ReturnClass {
    fn of(ret: Option<&ReturnKind>) -> FfiResult<Self> {
        match ret {
            None => Ok(ReturnClass::Void),
            Some(ParamKind::F32) => Ok(ReturnClass::F32),
            Some(ParamKind::F64) => Ok(ReturnClass::F64),
            Some(ParamKind::Struct(_)) => Err(FfiError::UnsupportedKind(
                "struct return values".to_string(),
            )),
            Some(_) => Ok(ReturnClass::Int),
        }
    }
}

/// Both raw return registers of a native call
///
/// Only the slot selected by the plan's `ReturnClass` is meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawReturn {
    pub int: u64,
    pub float: u64,
}

/// Register and stack contents for one native call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallImage {
    ints: [u64; MAX_INT_REGISTERS],
    floats: [u64; MAX_FLOAT_REGISTERS],
    stack: Vec<u64>,
}

impl CallImage {
    pub fn new(stack_slots: usize) -> Self {
        Self {
            ints: [0; MAX_INT_REGISTERS],
            floats: [0; MAX_FLOAT_REGISTERS],
            stack: vec![0; stack_slots],
        }
    }

    pub fn get(&self, loc: Location) -> u64 {
        match loc {
            Location::Int(i) => self.ints.get(i).copied().unwrap_or(0),
            Location::Float(i) => self.floats.get(i).copied().unwrap_or(0),
            Location::Stack(i) => self.stack.get(i).copied().unwrap_or(0),
        }
    }

    pub fn set(&mut self, loc: Location, bits: u64) {
        match loc {
            Location::Int(i) => self.ints[i] = bits,
            Location::Float(i) => self.floats[i] = bits,
            Location::Stack(i) => {
                if i >= self.stack.len() {
                    self.stack.resize(i + 1, 0);
                }
                self.stack[i] = bits;
            }
        }
    }

    /// Reference to the slot, for handing its storage to the raw call
    pub fn slot_ref(&self, loc: Location) -> &u64 {
        const ZERO: u64 = 0;
        match loc {
            Location::Int(i) => self.ints.get(i).unwrap_or(&ZERO),
            Location::Float(i) => self.floats.get(i).unwrap_or(&ZERO),
            Location::Stack(i) => self.stack.get(i).unwrap_or(&ZERO),
        }
    }

    pub fn ints(&self) -> &[u64] {
        &self.ints
    }

    pub fn floats(&self) -> &[u64] {
        &self.floats
    }

    pub fn stack(&self) -> &[u64] {
        &self.stack
    }
}

/// Register allocator shared by the sequential conventions
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegisterFile {
    int_limit: usize,
    float_limit: usize,
    next_int: usize,
    next_float: usize,
    next_stack: usize,
}

impl RegisterFile {
    pub(crate) fn new(convention: Convention) -> Self {
        Self {
            int_limit: convention.int_registers(),
            float_limit: convention.float_registers(),
            next_int: 0,
            next_float: 0,
            next_stack: 0,
        }
    }

    pub(crate) fn take_int(&mut self) -> Option<Location> {
        (self.next_int < self.int_limit).then(|| {
            self.next_int += 1;
            Location::Int(self.next_int - 1)
        })
    }

    pub(crate) fn take_float(&mut self) -> Option<Location> {
        (self.next_float < self.float_limit).then(|| {
            self.next_float += 1;
            Location::Float(self.next_float - 1)
        })
    }

    /// Next integer register, or the next stack word once they run out
    pub(crate) fn int(&mut self) -> Location {
        match self.take_int() {
            Some(loc) => loc,
            None => Location::Stack(self.push_stack(1)),
        }
    }

    /// Next float register, or the next stack word once they run out
    pub(crate) fn float(&mut self) -> Location {
        match self.take_float() {
            Some(loc) => loc,
            None => Location::Stack(self.push_stack(1)),
        }
    }

    /// Reserve `words` consecutive stack words and return the first index
    pub(crate) fn push_stack(&mut self, words: usize) -> usize {
        let start = self.next_stack;
        self.next_stack += words;
        start
    }

    pub(crate) fn ints_free(&self) -> usize {
        self.int_limit - self.next_int
    }

    pub(crate) fn floats_free(&self) -> usize {
        self.float_limit - self.next_float
    }

    pub(crate) fn exhaust_ints(&mut self) {
        self.next_int = self.int_limit;
    }

    pub(crate) fn exhaust_floats(&mut self) {
        self.next_float = self.float_limit;
    }

    pub(crate) fn stack_slots(&self) -> usize {
        self.next_stack
    }
}

/// Copy a whole aggregate onto the stack as consecutive 8-byte words
pub(crate) fn stack_pieces(layout: &StructLayout, regs: &mut RegisterFile) -> Placement {
    let words = layout.size().div_ceil(8);
    let start = regs.push_stack(words);
    Placement::Pieces(
        (0..words)
            .map(|k| Piece {
                offset: k * 8,
                size: (layout.size() - k * 8).min(8),
                loc: Location::Stack(start + k),
            })
            .collect(),
    )
}

/// Pieces for 8-byte chunks of an aggregate, one location each
pub(crate) fn chunk_pieces(layout: &StructLayout, locs: impl IntoIterator<Item = Location>) -> Vec<Piece> {
    locs.into_iter()
        .enumerate()
        .map(|(k, loc)| Piece {
            offset: k * 8,
            size: (layout.size() - k * 8).min(8),
            loc,
        })
        .collect()
}

/// Output of a convention's classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub(crate) placements: Vec<Placement>,
    pub(crate) stack_slots: usize,
}

/// Precomputed placement of every argument of a signature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallPlan {
    convention: Convention,
    signature: Signature,
    placements: Vec<Placement>,
    ret: ReturnClass,
    stack_slots: usize,
    #[serde(skip)]
    lowering: Vec<RawSlot>,
}

impl CallPlan {
    /// Classify `signature` under `convention`
    ///
    /// Fails with `UnsupportedKind` for struct returns (also inside nested
    /// callback signatures) and `TooManyArguments` when the stack words
    /// exceed the convention's capacity.
    pub fn new(convention: Convention, signature: &Signature) -> FfiResult<Self> {
        for kind in signature.params().iter().chain(signature.ret()) {
            if let ParamKind::Callback(inner) = kind {
                CallPlan::new(convention, inner)?;
            }
        }

        let ret = ReturnClass::of(signature.ret())?;
        let assignment = match convention {
            Convention::SysV => sysv::classify(signature.params()),
            Convention::Aapcs64 => aapcs64::classify(signature.params()),
            Convention::Win64 => win64::classify(signature.params()),
        };

        let capacity = convention.max_stack_slots();
        if assignment.stack_slots > capacity {
            return Err(FfiError::TooManyArguments {
                needed: assignment.stack_slots,
                capacity,
            });
        }

        let lowering = lower(convention, &assignment);
        Ok(Self {
            convention,
            signature: signature.clone(),
            placements: assignment.placements,
            ret,
            stack_slots: assignment.stack_slots,
            lowering,
        })
    }

    /// Plan for the build target's convention
    pub fn host(signature: &Signature) -> FfiResult<Self> {
        Self::new(Convention::host(), signature)
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn return_class(&self) -> ReturnClass {
        self.ret
    }

    pub fn stack_slots(&self) -> usize {
        self.stack_slots
    }

    /// Integer and float registers holding arguments
    pub fn registers_used(&self) -> (usize, usize) {
        let mut ints = 0;
        let mut floats = 0;
        for loc in self.locations() {
            match loc {
                Location::Int(i) => ints = ints.max(i + 1),
                Location::Float(i) => floats = floats.max(i + 1),
                Location::Stack(_) => {}
            }
        }
        (ints, floats)
    }

    fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.placements.iter().flat_map(|placement| {
            let locs: Vec<Location> = match placement {
                Placement::Scalar(loc) | Placement::Indirect(loc) => vec![*loc],
                Placement::Pieces(pieces) => pieces.iter().map(|p| p.loc).collect(),
                Placement::Empty => Vec::new(),
            };
            locs
        })
    }

    /// The ordered raw argument list for the trampoline library
    ///
    /// Sequential conventions list every integer register, then every float
    /// register, then the stack words. Win64 lists its four positional
    /// registers (float where the plan put a float) and then the stack.
    pub fn lowering(&self) -> &[RawSlot] {
        &self.lowering
    }

    /// Encode host values into the slots this plan names
    ///
    /// Converted strings and by-reference struct copies are registered in
    /// `keep`, which must outlive the native call.
    pub fn build_image(&self, values: &[Value], keep: &mut KeepAlive) -> FfiResult<CallImage> {
        let params = self.signature.params();
        if values.len() != params.len() {
            return Err(FfiError::ArityMismatch {
                expected: params.len(),
                got: values.len(),
            });
        }

        let mut image = CallImage::new(self.stack_slots);
        for ((kind, placement), value) in params.iter().zip(&self.placements).zip(values) {
            match placement {
                Placement::Scalar(loc) => {
                    image.set(*loc, marshal::encode_param(kind, value, keep)?);
                }
                Placement::Pieces(pieces) => {
                    let packed = pack_struct(layout_of(kind)?, value)?;
                    let bytes = packed.bytes();
                    for piece in pieces {
                        let mut word = [0u8; 8];
                        word[..piece.size]
                            .copy_from_slice(&bytes[piece.offset..piece.offset + piece.size]);
                        image.set(piece.loc, u64::from_le_bytes(word));
                    }
                }
                Placement::Indirect(loc) => {
                    let packed = pack_struct(layout_of(kind)?, value)?;
                    let address = keep.hold_block(packed.into_words());
                    image.set(*loc, address as u64);
                }
                Placement::Empty => {
                    pack_struct(layout_of(kind)?, value)?;
                }
            }
        }
        Ok(image)
    }

    /// Read argument values back out of an image built by this plan
    ///
    /// Strings are copied out of native memory and callback arguments come
    /// back as bound `Function` values, so the result owns everything.
    pub fn decode_args(&self, image: &CallImage) -> Vec<Value> {
        self.signature
            .params()
            .iter()
            .zip(&self.placements)
            .map(|(kind, placement)| match (placement, kind) {
                (Placement::Scalar(loc), _) => marshal::decode_param(kind, image.get(*loc)),
                (Placement::Pieces(pieces), ParamKind::Struct(layout)) => {
                    let mut bytes = vec![0u8; layout.size()];
                    for piece in pieces {
                        bytes[piece.offset..piece.offset + piece.size]
                            .copy_from_slice(&image.get(piece.loc).to_le_bytes()[..piece.size]);
                    }
                    unpack_struct(layout, &bytes)
                }
                (Placement::Indirect(loc), ParamKind::Struct(layout)) => {
                    let address = image.get(*loc) as usize;
                    if address == 0 {
                        return unpack_struct(layout, &[]);
                    }
                    // Safety: the caller passed the address of a copy of the
                    // aggregate, as the convention requires.
                    let bytes =
                        unsafe { std::slice::from_raw_parts(address as *const u8, layout.size()) };
                    unpack_struct(layout, bytes)
                }
                (Placement::Empty, ParamKind::Struct(layout)) => unpack_struct(layout, &[]),
                _ => Value::Void,
            })
            .collect()
    }

    /// Decode the raw return registers per the declared return kind
    pub fn decode_return(&self, raw: RawReturn) -> Value {
        match (self.signature.ret(), self.ret) {
            (None, _) | (_, ReturnClass::Void) => Value::Void,
            (Some(_), ReturnClass::F32) => Value::F32(f32::from_bits(raw.float as u32)),
            (Some(_), ReturnClass::F64) => Value::F64(f64::from_bits(raw.float)),
            (Some(kind), ReturnClass::Int) => marshal::decode_param(kind, raw.int),
        }
    }

    /// Encode a host return value into the bits of its return register
    pub fn encode_return(&self, value: &Value) -> FfiResult<u64> {
        match self.signature.ret() {
            None => Ok(0),
            Some(kind) => {
                let mut keep = KeepAlive::new();
                let bits = marshal::encode_param(kind, value, &mut keep)?;
                if !keep.is_empty() {
                    return Err(FfiError::UnsupportedKind(format!(
                        "{} return value from a callback",
                        kind
                    )));
                }
                Ok(bits)
            }
        }
    }
}

fn layout_of(kind: &ParamKind) -> FfiResult<&StructLayout> {
    match kind {
        ParamKind::Struct(layout) => Ok(layout),
        other => Err(FfiError::UnsupportedKind(format!(
            "{} placed as an aggregate",
            other
        ))),
    }
}

fn lower(convention: Convention, assignment: &Assignment) -> Vec<RawSlot> {
    let mut slots = Vec::with_capacity(MAX_ARGS + MAX_FLOAT_REGISTERS);
    match convention {
        Convention::SysV | Convention::Aapcs64 => {
            slots.extend((0..convention.int_registers()).map(Location::Int));
            slots.extend((0..convention.float_registers()).map(Location::Float));
        }
        Convention::Win64 => {
            let mut positional: Vec<Location> =
                (0..convention.int_registers()).map(Location::Int).collect();
            for placement in &assignment.placements {
                if let Placement::Scalar(Location::Float(i)) = placement {
                    positional[*i] = Location::Float(*i);
                }
            }
            slots.extend(positional);
        }
    }
    slots.extend((0..assignment.stack_slots).map(Location::Stack));
    slots
}
