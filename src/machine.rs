//! Machine model: byte sizes, alignment and pointer width of C types.
//!
//! The heap graph itself only deals in byte offsets and sizes. This module is
//! what turns a declared C type into those numbers, following the System V
//! layout rules used on Linux.

/// A scalar C type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scalar {
    Bool,
    Char,
    Short,
    Int,
    Long,
    LongLong,
    Float,
    Double,
    LongDouble,
}

/// The subset of C types whose layout the domain needs to know.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum CType {
    Scalar(Scalar),
    Pointer,
    Array(Box<CType>, u64),
    Struct(Vec<CType>),
}

impl CType {
    pub fn int() -> Self {
        CType::Scalar(Scalar::Int)
    }

    pub fn array(elem: CType, len: u64) -> Self {
        CType::Array(Box::new(elem), len)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer)
    }
}

/// Sizes and alignments of the primitive types of one target platform.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct MachineModel {
    pub name: &'static str,
    pub size_of_short: u64,
    pub size_of_int: u64,
    pub size_of_long: u64,
    pub size_of_long_long: u64,
    pub size_of_float: u64,
    pub size_of_double: u64,
    pub size_of_long_double: u64,
    pub size_of_pointer: u64,
    pub align_of_long_long: u64,
    pub align_of_double: u64,
    pub align_of_long_double: u64,
}

impl MachineModel {
    /// 32-bit Linux (i386 System V ABI).
    pub const LINUX32: MachineModel = MachineModel {
        name: "linux32",
        size_of_short: 2,
        size_of_int: 4,
        size_of_long: 4,
        size_of_long_long: 8,
        size_of_float: 4,
        size_of_double: 8,
        size_of_long_double: 12,
        size_of_pointer: 4,
        align_of_long_long: 4,
        align_of_double: 4,
        align_of_long_double: 4,
    };

    /// 64-bit Linux (x86-64 System V ABI).
    pub const LINUX64: MachineModel = MachineModel {
        name: "linux64",
        size_of_short: 2,
        size_of_int: 4,
        size_of_long: 8,
        size_of_long_long: 8,
        size_of_float: 4,
        size_of_double: 8,
        size_of_long_double: 16,
        size_of_pointer: 8,
        align_of_long_long: 8,
        align_of_double: 8,
        align_of_long_double: 16,
    };

    pub fn pointer_size(&self) -> u64 {
        self.size_of_pointer
    }

    fn scalar_size(&self, scalar: Scalar) -> u64 {
        match scalar {
            Scalar::Bool | Scalar::Char => 1,
            Scalar::Short => self.size_of_short,
            Scalar::Int => self.size_of_int,
            Scalar::Long => self.size_of_long,
            Scalar::LongLong => self.size_of_long_long,
            Scalar::Float => self.size_of_float,
            Scalar::Double => self.size_of_double,
            Scalar::LongDouble => self.size_of_long_double,
        }
    }

    fn scalar_align(&self, scalar: Scalar) -> u64 {
        match scalar {
            Scalar::LongLong => self.align_of_long_long,
            Scalar::Double => self.align_of_double,
            Scalar::LongDouble => self.align_of_long_double,
            _ => self.scalar_size(scalar),
        }
    }

    /// Size in bytes, including trailing struct padding.
    pub fn size_of(&self, ty: &CType) -> u64 {
        match ty {
            CType::Scalar(scalar) => self.scalar_size(*scalar),
            CType::Pointer => self.size_of_pointer,
            CType::Array(elem, len) => self.size_of(elem) * len,
            CType::Struct(fields) => {
                let end = self.field_offsets(fields).last().map_or(0, |&(offset, size)| offset + size);
                round_up(end, self.align_of(ty))
            }
        }
    }

    /// Required alignment in bytes.
    pub fn align_of(&self, ty: &CType) -> u64 {
        match ty {
            CType::Scalar(scalar) => self.scalar_align(*scalar),
            CType::Pointer => self.size_of_pointer,
            CType::Array(elem, _) => self.align_of(elem),
            CType::Struct(fields) => fields.iter().map(|f| self.align_of(f)).max().unwrap_or(1),
        }
    }

    /// Offset and size of every member of a struct with the given field types.
    pub fn field_offsets(&self, fields: &[CType]) -> Vec<(u64, u64)> {
        let mut offset = 0;
        let mut result = Vec::with_capacity(fields.len());
        for field in fields {
            offset = round_up(offset, self.align_of(field));
            let size = self.size_of(field);
            result.push((offset, size));
            offset += size;
        }
        result
    }
}

impl Default for MachineModel {
    fn default() -> Self {
        MachineModel::LINUX64
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}
