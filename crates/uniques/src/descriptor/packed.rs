//! Variable-size packed keys.
//!
//! A packed key is a 4-byte little-endian payload length followed by the
//! payload.  The payload is the concatenation of the key parts, each encoded
//! as:
//!
//! - a null indicator byte (0 for NULL, 1 otherwise) if the part is nullable,
//!   and nothing else if the value is NULL;
//! - 8 little-endian bytes for integers and doubles;
//! - a 1-byte (or 2-byte, if the part may exceed 255 bytes) little-endian
//!   length followed by the bytes, for byte strings.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Size of the length prefix of a packed key.
pub const SIZE_OF_LENGTH_FIELD: usize = 4;

/// The type of a key part.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Int,
    UInt,
    Double,
    /// Byte string of at most `max_length` bytes, compared bytewise.
    Bytes { max_length: u16 },
}

/// One part of a composite key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub descending: bool,
}

impl SortField {
    pub const fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            descending: false,
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    pub const fn descending(self) -> Self {
        Self {
            descending: true,
            ..self
        }
    }

    /// Width of the length field of a byte string part.
    fn length_bytes(max_length: u16) -> usize {
        if max_length > u8::MAX as u16 {
            2
        } else {
            1
        }
    }

    /// The most bytes a value of this part can pack to.
    pub fn max_packed_length(&self) -> usize {
        let value = match self.kind {
            FieldKind::Int | FieldKind::UInt | FieldKind::Double => 8,
            FieldKind::Bytes { max_length } => {
                Self::length_bytes(max_length) + max_length as usize
            }
        };
        value + self.nullable as usize
    }

    fn pack(
        &self,
        index: usize,
        value: &Datum<'_>,
        out: &mut Vec<u8>,
    ) -> Result<(), DescriptorError> {
        if let Datum::Null = value {
            if !self.nullable {
                return Err(DescriptorError::NullNotAllowed { field: index });
            }
            out.push(0);
            return Ok(());
        }
        if self.nullable {
            out.push(1);
        }
        match (self.kind, value) {
            (FieldKind::Int, Datum::Int(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (FieldKind::UInt, Datum::UInt(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (FieldKind::Double, Datum::Double(v)) => {
                // -0.0 and 0.0 must pack (and so compare) equal.
                let v = if *v == 0.0 { 0.0f64 } else { *v };
                out.extend_from_slice(&v.to_bits().to_le_bytes())
            }
            (FieldKind::Bytes { max_length }, Datum::Bytes(bytes)) => {
                if bytes.len() > max_length as usize {
                    return Err(DescriptorError::ValueTooLong {
                        field: index,
                        len: bytes.len(),
                        max: max_length as usize,
                    });
                }
                match Self::length_bytes(max_length) {
                    1 => out.push(bytes.len() as u8),
                    _ => out.extend_from_slice(&(bytes.len() as u16).to_le_bytes()),
                }
                out.extend_from_slice(bytes);
            }
            _ => return Err(DescriptorError::TypeMismatch { field: index }),
        }
        Ok(())
    }

    /// Decodes one value from the front of `data`, returning it and the rest
    /// of `data`.
    fn unpack<'a>(&self, data: &'a [u8]) -> Option<(Datum<'a>, &'a [u8])> {
        let data = if self.nullable {
            let (&indicator, rest) = data.split_first()?;
            if indicator == 0 {
                return Some((Datum::Null, rest));
            }
            rest
        } else {
            data
        };
        match self.kind {
            FieldKind::Int => {
                let (bytes, rest) = split_array::<8>(data)?;
                Some((Datum::Int(i64::from_le_bytes(bytes)), rest))
            }
            FieldKind::UInt => {
                let (bytes, rest) = split_array::<8>(data)?;
                Some((Datum::UInt(u64::from_le_bytes(bytes)), rest))
            }
            FieldKind::Double => {
                let (bytes, rest) = split_array::<8>(data)?;
                Some((Datum::Double(f64::from_bits(u64::from_le_bytes(bytes))), rest))
            }
            FieldKind::Bytes { max_length } => {
                let (len, rest) = match Self::length_bytes(max_length) {
                    1 => {
                        let (&len, rest) = data.split_first()?;
                        (len as usize, rest)
                    }
                    _ => {
                        let (len, rest) = split_array::<2>(data)?;
                        (u16::from_le_bytes(len) as usize, rest)
                    }
                };
                if rest.len() < len {
                    return None;
                }
                let (bytes, rest) = rest.split_at(len);
                Some((Datum::Bytes(bytes), rest))
            }
        }
    }

    fn compare(&self, a: &Datum<'_>, b: &Datum<'_>) -> Ordering {
        let ordering = a.cmp_same_kind(b);
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

fn split_array<const N: usize>(data: &[u8]) -> Option<([u8; N], &[u8])> {
    if data.len() < N {
        return None;
    }
    let (head, rest) = data.split_at(N);
    Some((head.try_into().ok()?, rest))
}

/// A source value for one key part.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Datum<'a> {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bytes(&'a [u8]),
}

impl Datum<'_> {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// NULL sorts before every value.  Values of different kinds cannot come
    /// out of the same key part, so their order is arbitrary but consistent.
    fn cmp_same_kind(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::UInt(a), Self::UInt(b)) => a.cmp(b),
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) => 1,
            Self::UInt(_) => 2,
            Self::Double(_) => 3,
            Self::Bytes(_) => 4,
        }
    }
}

/// Descriptor for length-prefixed keys packed from composite values.
#[derive(Debug)]
pub struct VariableSizeKeys {
    /// Maximum packed key length, including the length prefix.
    max_key_length: usize,

    /// Key parts, in significance order.  Empty until [`Self::setup`].
    sort_fields: Vec<SortField>,

    /// Scratch buffer holding the most recently packed record.
    packed: Vec<u8>,

    ready: bool,
}

impl VariableSizeKeys {
    pub fn new(max_key_length: usize) -> Self {
        Self {
            max_key_length,
            sort_fields: Vec::new(),
            packed: Vec::new(),
            ready: false,
        }
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    pub fn sort_fields(&self) -> &[SortField] {
        &self.sort_fields
    }

    /// Returns the length of the key at the start of `key`, including the
    /// length prefix, or `None` if `key` is too short to hold the prefix.
    pub fn read_packed_length(key: &[u8]) -> Option<usize> {
        let (prefix, _) = split_array::<SIZE_OF_LENGTH_FIELD>(key)?;
        Some(SIZE_OF_LENGTH_FIELD + u32::from_le_bytes(prefix) as usize)
    }

    /// Writes the length prefix for a key of `size` bytes, prefix included.
    fn store_packed_length(key: &mut [u8], size: usize) {
        let payload = (size - SIZE_OF_LENGTH_FIELD) as u32;
        key[..SIZE_OF_LENGTH_FIELD].copy_from_slice(&payload.to_le_bytes());
    }

    fn payload(key: &[u8]) -> &[u8] {
        match Self::read_packed_length(key) {
            Some(len) => &key[SIZE_OF_LENGTH_FIELD..len.min(key.len())],
            None => &[],
        }
    }

    /// Resolves the key parts and allocates the packing buffer.
    pub fn setup(&mut self, fields: Vec<SortField>) -> Result<(), DescriptorError> {
        self.ready = false;
        let required = SIZE_OF_LENGTH_FIELD
            + fields
                .iter()
                .map(SortField::max_packed_length)
                .sum::<usize>();
        if required > self.max_key_length {
            return Err(DescriptorError::KeyTooWide {
                required,
                max: self.max_key_length,
            });
        }
        self.packed.clear();
        self.packed
            .try_reserve_exact(required)
            .map_err(|_| DescriptorError::OutOfMemory {
                requested: required,
            })?;
        self.sort_fields = fields;
        self.ready = true;
        Ok(())
    }

    /// Packs `values`, one per key part, into the scratch buffer.
    ///
    /// Returns the packed length including the prefix, or 0 if `exclude_nulls`
    /// is set and some value is NULL.
    pub fn make_packed_record(
        &mut self,
        values: &[Datum<'_>],
        exclude_nulls: bool,
    ) -> Result<usize, DescriptorError> {
        self.packed.clear();
        if !self.ready {
            return Err(DescriptorError::NotSetUp);
        }
        if values.len() != self.sort_fields.len() {
            return Err(DescriptorError::ArityMismatch {
                expected: self.sort_fields.len(),
                actual: values.len(),
            });
        }
        if exclude_nulls && values.iter().any(Datum::is_null) {
            return Ok(0);
        }

        self.packed.extend_from_slice(&[0; SIZE_OF_LENGTH_FIELD]);
        for (index, (field, value)) in self.sort_fields.iter().zip(values).enumerate() {
            if let Err(error) = field.pack(index, value, &mut self.packed) {
                self.packed.clear();
                return Err(error);
            }
        }
        let size = self.packed.len();
        debug_assert!(size <= self.max_key_length);
        Self::store_packed_length(&mut self.packed, size);
        Ok(size)
    }

    /// The most recently packed record; empty if the last call to
    /// [`Self::make_packed_record`] returned 0 or failed.
    pub fn packed_rec(&self) -> &[u8] {
        &self.packed
    }

    /// Moves the scratch buffer out, leaving an empty one behind.
    pub(crate) fn take_packed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.packed)
    }

    /// Puts back a buffer taken with [`Self::take_packed`].
    pub(crate) fn restore_packed(&mut self, packed: Vec<u8>) {
        self.packed = packed;
    }

    /// Decodes a packed key back into its key parts.
    pub fn unpack_record<'a>(&self, key: &'a [u8]) -> Result<Vec<Datum<'a>>, DescriptorError> {
        let len = Self::read_packed_length(key).ok_or(DescriptorError::Corrupted)?;
        if key.len() < len {
            return Err(DescriptorError::Corrupted);
        }
        let mut rest = &key[SIZE_OF_LENGTH_FIELD..len];
        let mut values = Vec::with_capacity(self.sort_fields.len());
        for field in &self.sort_fields {
            let (value, tail) = field.unpack(rest).ok_or(DescriptorError::Corrupted)?;
            values.push(value);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(DescriptorError::Corrupted);
        }
        Ok(values)
    }

    fn compare_payloads(fields: &[SortField], mut a: &[u8], mut b: &[u8]) -> Ordering {
        for field in fields {
            let (Some((value_a, rest_a)), Some((value_b, rest_b))) =
                (field.unpack(a), field.unpack(b))
            else {
                return a.cmp(b);
            };
            match field.compare(&value_a, &value_b) {
                Ordering::Equal => (),
                ordering => return ordering,
            }
            a = rest_a;
            b = rest_b;
        }
        a.cmp(b)
    }

    /// Compares two packed keys part by part.  Without key parts, payloads
    /// compare bytewise.
    pub fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::compare_payloads(&self.sort_fields, Self::payload(a), Self::payload(b))
    }

    /// Compares two packed keys on their first key part only.
    pub fn compare_keys_for_single_arg(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a, b) = (Self::payload(a), Self::payload(b));
        match self.sort_fields.first() {
            Some(field) => match (field.unpack(a), field.unpack(b)) {
                (Some((value_a, _)), Some((value_b, _))) => field.compare(&value_a, &value_b),
                _ => a.cmp(b),
            },
            None => a.cmp(b),
        }
    }
}
