use num_enum::{IntoPrimitive, TryFromPrimitive};
use num_traits::{Bounded, NumCast, ToPrimitive};

/// Byte order of a store's buffer and of everything derived from it
/// (journal wire records, sync ids, directory leaf values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn write_u16(self, v: u16, out: &mut [u8]) {
        let b = match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        out[..2].copy_from_slice(&b);
    }

    pub fn read_u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn write_u32(self, v: u32, out: &mut [u8]) {
        let b = match self {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        out[..4].copy_from_slice(&b);
    }

    pub fn read_u32(self, b: &[u8]) -> u32 {
        let raw = [b[0], b[1], b[2], b[3]];
        match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }
}

/// Type tag of a stored object.
///
/// A single byte with bitfields: the low three bits hold the size class of
/// fixed-size types (`size = class + 1`), the upper bits hold flags. The
/// named tags below are the only values a directory may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(pub u8);

impl TypeTag {
    pub const MASK_SIZE: u8 = 0x07;
    pub const MASK_FLAGS: u8 = 0x78;
    pub const FLAG_SIGNED: u8 = 0x08;
    pub const FLAG_INT: u8 = 0x10;
    pub const FLAG_FIXED: u8 = 0x20;
    pub const FLAG_FUNCTION: u8 = 0x40;

    pub const INT8: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | Self::FLAG_SIGNED);
    pub const UINT8: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT);
    pub const INT16: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | Self::FLAG_SIGNED | 1);
    pub const UINT16: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | 1);
    pub const INT32: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | Self::FLAG_SIGNED | 3);
    pub const UINT32: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | 3);
    pub const INT64: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | Self::FLAG_SIGNED | 7);
    pub const UINT64: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_INT | 7);
    pub const FLOAT: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_SIGNED | 3);
    pub const DOUBLE: TypeTag = TypeTag(Self::FLAG_FIXED | Self::FLAG_SIGNED | 7);
    pub const BOOL: TypeTag = TypeTag(Self::FLAG_FIXED);
    pub const POINTER32: TypeTag = TypeTag(Self::FLAG_FIXED | 3);
    pub const POINTER64: TypeTag = TypeTag(Self::FLAG_FIXED | 7);
    pub const VOID: TypeTag = TypeTag(0);
    pub const BLOB: TypeTag = TypeTag(1);
    pub const STRING: TypeTag = TypeTag(2);
    pub const INVALID: TypeTag = TypeTag(0xff);

    pub fn is_function(self) -> bool {
        self.0 & Self::FLAG_FUNCTION != 0
    }

    pub fn is_fixed(self) -> bool {
        self.0 & Self::FLAG_FIXED != 0
    }

    pub fn is_int(self) -> bool {
        self.is_fixed() && self.0 & Self::FLAG_INT != 0
    }

    pub fn is_signed(self) -> bool {
        self.0 & Self::FLAG_SIGNED != 0
    }

    /// Void, blob and string: no flags set besides the size class.
    pub fn is_special(self) -> bool {
        self.0 & Self::MASK_FLAGS == 0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0xff
    }

    /// Size in bytes of a fixed-size type, 0 otherwise.
    pub fn size(self) -> usize {
        if self.is_fixed() {
            ((self.0 & Self::MASK_SIZE) as usize) + 1
        } else {
            0
        }
    }

    /// Strip the function flag, leaving the value type of the object.
    pub fn value_type(self) -> TypeTag {
        TypeTag(self.0 & !Self::FLAG_FUNCTION)
    }

    /// A directory may only carry one of the named tags (optionally with the
    /// function flag).
    pub fn is_known(self) -> bool {
        TypeId::try_from(self.0 & !Self::FLAG_FUNCTION).is_ok()
    }
}

/// The closed set of value-type bytes a directory leaf may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TypeId {
    Void = 0x00,
    Blob = 0x01,
    String = 0x02,
    Bool = 0x20,
    Uint8 = 0x30,
    Uint16 = 0x31,
    Uint32 = 0x33,
    Uint64 = 0x37,
    Int8 = 0x38,
    Int16 = 0x39,
    Int32 = 0x3b,
    Int64 = 0x3f,
    Float = 0x2b,
    Double = 0x2f,
    Pointer32 = 0x23,
    Pointer64 = 0x27,
}

/// Values that can live in a fixed-size variable.
///
/// The codec honors the owning store's endianness; `TAG` is the directory
/// tag the type corresponds to.
pub trait Value: Copy + PartialEq {
    const TAG: TypeTag;
    const SIZE: usize;

    fn store(self, endian: Endian, out: &mut [u8]);
    fn load(endian: Endian, raw: &[u8]) -> Self;
}

macro_rules! impl_value_int {
    ($t:ty, $tag:expr) => {
        impl Value for $t {
            const TAG: TypeTag = $tag;
            const SIZE: usize = std::mem::size_of::<$t>();

            fn store(self, endian: Endian, out: &mut [u8]) {
                let b = match endian {
                    Endian::Little => self.to_le_bytes(),
                    Endian::Big => self.to_be_bytes(),
                };
                out[..b.len()].copy_from_slice(&b);
            }

            fn load(endian: Endian, raw: &[u8]) -> Self {
                let mut b = [0u8; std::mem::size_of::<$t>()];
                let len = b.len();
                b.copy_from_slice(&raw[..len]);
                match endian {
                    Endian::Little => <$t>::from_le_bytes(b),
                    Endian::Big => <$t>::from_be_bytes(b),
                }
            }
        }
    };
}

impl_value_int!(i8, TypeTag::INT8);
impl_value_int!(u8, TypeTag::UINT8);
impl_value_int!(i16, TypeTag::INT16);
impl_value_int!(u16, TypeTag::UINT16);
impl_value_int!(i32, TypeTag::INT32);
impl_value_int!(u32, TypeTag::UINT32);
impl_value_int!(i64, TypeTag::INT64);
impl_value_int!(u64, TypeTag::UINT64);
impl_value_int!(f32, TypeTag::FLOAT);
impl_value_int!(f64, TypeTag::DOUBLE);

impl Value for bool {
    const TAG: TypeTag = TypeTag::BOOL;
    const SIZE: usize = 1;

    fn store(self, _endian: Endian, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn load(_endian: Endian, raw: &[u8]) -> Self {
        raw[0] != 0
    }
}

/// Convert between numeric types, clamping to the target's range instead of
/// wrapping. Out-of-range floats saturate, NaN maps to zero.
pub fn saturated_cast<U, T>(v: T) -> U
where
    T: ToPrimitive + Copy,
    U: NumCast + Bounded,
{
    match U::from(v) {
        Some(u) => u,
        None => match v.to_f64() {
            Some(f) if f.is_nan() => U::from(0u8).unwrap_or_else(U::min_value),
            Some(f) if f < 0.0 => U::min_value(),
            _ => U::max_value(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bits() {
        assert_eq!(TypeTag::INT32.size(), 4);
        assert_eq!(TypeTag::UINT8.size(), 1);
        assert_eq!(TypeTag::DOUBLE.size(), 8);
        assert_eq!(TypeTag::BLOB.size(), 0);
        assert!(TypeTag::INT16.is_int());
        assert!(!TypeTag::FLOAT.is_int());
        assert!(TypeTag::FLOAT.is_fixed());
        assert!(TypeTag::BLOB.is_special());
        assert!(!TypeTag::INVALID.is_valid());
        let f = TypeTag(TypeTag::UINT16.0 | TypeTag::FLAG_FUNCTION);
        assert!(f.is_function());
        assert_eq!(f.value_type(), TypeTag::UINT16);
    }

    #[test]
    fn value_codec_endianness() {
        let mut b = [0u8; 4];
        0x1122_3344u32.store(Endian::Little, &mut b);
        assert_eq!(b, [0x44, 0x33, 0x22, 0x11]);
        0x1122_3344u32.store(Endian::Big, &mut b);
        assert_eq!(b, [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(u32::load(Endian::Big, &b), 0x1122_3344);
    }

    #[test]
    fn saturating_conversions() {
        assert_eq!(saturated_cast::<u8, _>(300i32), 255u8);
        assert_eq!(saturated_cast::<i8, _>(-300i32), -128i8);
        assert_eq!(saturated_cast::<u16, _>(1.5f64), 1u16);
        assert_eq!(saturated_cast::<u8, _>(-1.0f32), 0u8);
    }
}
