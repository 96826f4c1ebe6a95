//! Typed views over guest linear memory.
//!
//! All values are little-endian. Address 0 is the guest null pointer: every
//! accessor rejects it with [`MemoryError::NullPointer`] before touching
//! memory.
//!
//! Guest objects carry an 8-byte header: the runtime type id at `ptr - 8`
//! and the payload size in bytes at `ptr - 4`. Strings are UTF-16LE code
//! units whose byte length is the payload size.

use lumen_script::runtime::OBJECT_HEADER_SIZE;

/// Errors produced by guest memory accesses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The guest passed or stored a null pointer where an object was
    /// expected.
    #[error("null guest pointer")]
    NullPointer,

    /// The access does not fit inside linear memory.
    #[error("guest memory access out of bounds: address {address}, {len} bytes, memory size {size}")]
    OutOfBounds {
        address: u32,
        len: usize,
        size: usize,
    },

    /// The bytes at `address` are not a well-formed guest string.
    #[error("invalid guest string at {address}: {reason}")]
    InvalidString { address: u32, reason: String },
}

fn range(data_len: usize, address: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
    if address == 0 {
        return Err(MemoryError::NullPointer);
    }
    let start = address as usize;
    match start.checked_add(len) {
        Some(end) if end <= data_len => Ok(start..end),
        _ => Err(MemoryError::OutOfBounds {
            address,
            len,
            size: data_len,
        }),
    }
}

/// Address of an object header field, `address - back`.
fn header_field(address: u32, back: u32, data_len: usize) -> Result<u32, MemoryError> {
    if address == 0 {
        return Err(MemoryError::NullPointer);
    }
    address
        .checked_sub(back)
        .filter(|&a| a != 0)
        .ok_or(MemoryError::OutOfBounds {
            address,
            len: back as usize,
            size: data_len,
        })
}

macro_rules! read_methods {
    ($($name:ident -> $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&self, address: u32) -> Result<$ty, MemoryError> {
                Ok(<$ty>::from_le_bytes(self.array(address)?))
            }
        )*
    };
}

macro_rules! write_methods {
    ($($name:ident($ty:ty)),* $(,)?) => {
        $(
            pub fn $name(&mut self, address: u32, value: $ty) -> Result<(), MemoryError> {
                self.write_bytes(address, &value.to_le_bytes())
            }
        )*
    };
}

/// Shared read accessors for [`MemoryView`] and [`MemoryViewMut`].
macro_rules! impl_reads {
    ($view:ident) => {
        impl $view<'_> {
            /// Size of linear memory in bytes.
            pub fn len(&self) -> usize {
                self.data.len()
            }

            pub fn is_empty(&self) -> bool {
                self.data.is_empty()
            }

            /// Borrow `len` bytes at `address`.
            pub fn bytes(&self, address: u32, len: usize) -> Result<&[u8], MemoryError> {
                let range = range(self.data.len(), address, len)?;
                Ok(&self.data[range])
            }

            fn array<const N: usize>(&self, address: u32) -> Result<[u8; N], MemoryError> {
                let mut out = [0u8; N];
                out.copy_from_slice(self.bytes(address, N)?);
                Ok(out)
            }

            read_methods! {
                read_u8 -> u8,
                read_i8 -> i8,
                read_u16 -> u16,
                read_i16 -> i16,
                read_u32 -> u32,
                read_i32 -> i32,
                read_u64 -> u64,
                read_i64 -> i64,
                read_f32 -> f32,
                read_f64 -> f64,
            }

            pub fn read_byte(&self, address: u32) -> Result<u8, MemoryError> {
                self.read_u8(address)
            }

            pub fn read_int(&self, address: u32) -> Result<i32, MemoryError> {
                self.read_i32(address)
            }

            pub fn read_float(&self, address: u32) -> Result<f32, MemoryError> {
                self.read_f32(address)
            }

            /// Runtime type id from the object header.
            pub fn runtime_type_id(&self, address: u32) -> Result<u32, MemoryError> {
                let at = header_field(address, OBJECT_HEADER_SIZE, self.data.len())?;
                self.read_u32(at)
            }

            /// Payload size in bytes from the object header.
            pub fn runtime_size(&self, address: u32) -> Result<u32, MemoryError> {
                let at = header_field(address, 4, self.data.len())?;
                self.read_u32(at)
            }

            /// Decode the guest string object at `address`.
            pub fn read_string(&self, address: u32) -> Result<String, MemoryError> {
                let byte_len = self.runtime_size(address)? as usize;
                if byte_len % 2 != 0 {
                    return Err(MemoryError::InvalidString {
                        address,
                        reason: format!("odd byte length {byte_len}"),
                    });
                }
                let bytes = self.bytes(address, byte_len)?;
                let mut out = String::with_capacity(byte_len / 2);
                let units = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
                for decoded in char::decode_utf16(units) {
                    match decoded {
                        Ok(c) => out.push(c),
                        Err(e) => {
                            return Err(MemoryError::InvalidString {
                                address,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                Ok(out)
            }

            /// Sixteen column-major floats at `address`.
            pub fn read_mat4(&self, address: u32) -> Result<[f32; 16], MemoryError> {
                let bytes = self.bytes(address, 64)?;
                let mut out = [0f32; 16];
                for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                    *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                Ok(out)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// MemoryView
// ---------------------------------------------------------------------------

/// Read-only view of guest memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView<'a> {
    data: &'a [u8],
}

impl<'a> MemoryView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Borrow the 4x4 matrix at `address` for as long as the view lives.
    pub fn mat4(self, address: u32) -> Result<Mat4View<'a>, MemoryError> {
        let range = range(self.data.len(), address, 64)?;
        Ok(Mat4View {
            bytes: &self.data[range],
        })
    }
}

impl_reads!(MemoryView);

// ---------------------------------------------------------------------------
// MemoryViewMut
// ---------------------------------------------------------------------------

/// Read/write view of guest memory.
#[derive(Debug)]
pub struct MemoryViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> MemoryViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = range(self.data.len(), address, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    write_methods! {
        write_u8(u8),
        write_i8(i8),
        write_u16(u16),
        write_i16(i16),
        write_u32(u32),
        write_i32(i32),
        write_u64(u64),
        write_i64(i64),
        write_f32(f32),
        write_f64(f64),
    }

    /// Write `text` as UTF-16LE code units into caller-allocated space.
    /// Returns the number of code units written.
    pub fn write_string(&mut self, address: u32, text: &str) -> Result<usize, MemoryError> {
        let bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        self.write_bytes(address, &bytes)?;
        Ok(bytes.len() / 2)
    }

    /// Write consecutive `f32`s starting at `address`.
    pub fn write_f32s(&mut self, address: u32, values: &[f32]) -> Result<(), MemoryError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(address, &bytes)
    }
}

impl_reads!(MemoryViewMut);

// ---------------------------------------------------------------------------
// Mat4View
// ---------------------------------------------------------------------------

/// Zero-copy view of a column-major 4x4 `f32` matrix in guest memory.
#[derive(Debug, Clone, Copy)]
pub struct Mat4View<'a> {
    bytes: &'a [u8],
}

impl Mat4View<'_> {
    /// Element `index` in column-major order, `None` past 15.
    pub fn get(&self, index: usize) -> Option<f32> {
        (index < 16).then(|| self.element(index))
    }

    /// Column `col`, `None` past 3.
    pub fn column(&self, col: usize) -> Option<[f32; 4]> {
        (col < 4).then(|| std::array::from_fn(|row| self.element(col * 4 + row)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn to_mat4(&self) -> glam::Mat4 {
        glam::Mat4::from_cols_array(&std::array::from_fn(|i| self.element(i)))
    }

    /// `index` must be below 16; the view always spans 64 bytes.
    fn element(&self, index: usize) -> f32 {
        let at = index * 4;
        let b = &self.bytes[at..at + 4];
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A string object laid out the way the guest allocator does it.
    fn string_object(memory: &mut [u8], address: u32, text: &str) {
        let units = text.encode_utf16().count() as u32;
        let mut view = MemoryViewMut::new(memory);
        view.write_u32(address - 8, 1).unwrap();
        view.write_u32(address - 4, units * 2).unwrap();
        view.write_string(address, text).unwrap();
    }

    // -- Test 1: Null pointer is rejected by every accessor ------------------

    #[test]
    fn null_address_is_rejected_everywhere() {
        let mut memory = vec![0u8; 256];
        let mut view = MemoryViewMut::new(&mut memory);

        assert_eq!(view.read_u8(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_i16(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_i32(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_f32(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_f64(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_u64(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_byte(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_int(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_float(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_string(0), Err(MemoryError::NullPointer));
        assert_eq!(view.runtime_type_id(0), Err(MemoryError::NullPointer));
        assert_eq!(view.runtime_size(0), Err(MemoryError::NullPointer));
        assert_eq!(view.read_mat4(0), Err(MemoryError::NullPointer));
        assert_eq!(view.write_i32(0, 7), Err(MemoryError::NullPointer));
        assert_eq!(view.write_f32(0, 1.0), Err(MemoryError::NullPointer));
        assert_eq!(view.write_string(0, "x"), Err(MemoryError::NullPointer));
        assert!(MemoryView::new(&memory).mat4(0).is_err());
        assert!(memory.iter().all(|&b| b == 0), "memory must be untouched");
    }

    // -- Test 2: Out-of-range accesses are reported --------------------------

    #[test]
    fn out_of_bounds_accesses_fail() {
        let memory = vec![0u8; 64];
        let view = MemoryView::new(&memory);
        assert!(matches!(view.read_i32(62), Err(MemoryError::OutOfBounds { .. })));
        assert!(matches!(view.read_u8(64), Err(MemoryError::OutOfBounds { .. })));
        assert!(matches!(view.read_u8(u32::MAX), Err(MemoryError::OutOfBounds { .. })));
        assert!(matches!(view.runtime_type_id(4), Err(MemoryError::OutOfBounds { .. })));
        assert_eq!(view.read_u8(63), Ok(0));
    }

    // -- Test 3: Object headers ------------------------------------------------

    #[test]
    fn header_fields_are_read_before_the_object() {
        let mut memory = vec![0u8; 128];
        string_object(&mut memory, 32, "abc");
        let view = MemoryView::new(&memory);
        assert_eq!(view.runtime_type_id(32), Ok(1));
        assert_eq!(view.runtime_size(32), Ok(6));
        assert_eq!(view.read_string(32).unwrap(), "abc");
    }

    // -- Test 4: Unpaired surrogates are rejected ------------------------------

    #[test]
    fn unpaired_surrogate_is_invalid() {
        let mut memory = vec![0u8; 64];
        let mut view = MemoryViewMut::new(&mut memory);
        view.write_u32(28, 2).unwrap();
        view.write_u16(32, 0xd800).unwrap();
        assert!(matches!(
            view.read_string(32),
            Err(MemoryError::InvalidString { address: 32, .. })
        ));
    }

    // -- Test 5: Matrix view -----------------------------------------------------

    #[test]
    fn mat4_view_reads_column_major() {
        let mut memory = vec![0u8; 256];
        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        MemoryViewMut::new(&mut memory).write_f32s(64, &values).unwrap();

        let view = MemoryView::new(&memory).mat4(64).unwrap();
        assert_eq!(view.column(1), Some([4.0, 5.0, 6.0, 7.0]));
        assert_eq!(view.get(15), Some(15.0));
        assert_eq!(view.to_mat4().w_axis.x, 12.0);
        assert_eq!(view.as_bytes().len(), 64);
    }

    #[test]
    fn mat4_view_rejects_indices_past_the_matrix() {
        let mut memory = vec![0u8; 256];
        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        MemoryViewMut::new(&mut memory).write_f32s(64, &values).unwrap();

        let view = MemoryView::new(&memory).mat4(64).unwrap();
        assert_eq!(view.get(16), None);
        assert_eq!(view.get(17), None);
        assert_eq!(view.column(4), None);
    }

    proptest! {
        #[test]
        fn string_round_trip(text in "\\PC{0,64}") {
            let mut memory = vec![0u8; 1024];
            string_object(&mut memory, 16, &text);
            let view = MemoryView::new(&memory);
            prop_assert_eq!(view.read_string(16).unwrap(), text);
        }

        #[test]
        fn scalar_round_trip(a in any::<i16>(), b in any::<u32>(), c in any::<i64>(), d in -1.0e6f32..1.0e6, e in any::<f64>()) {
            let mut memory = vec![0u8; 64];
            let mut view = MemoryViewMut::new(&mut memory);
            view.write_i16(8, a).unwrap();
            view.write_u32(12, b).unwrap();
            view.write_i64(16, c).unwrap();
            view.write_f32(24, d).unwrap();
            view.write_f64(32, e).unwrap();

            prop_assert_eq!(view.read_i16(8).unwrap(), a);
            prop_assert_eq!(view.read_u32(12).unwrap(), b);
            prop_assert_eq!(view.read_i64(16).unwrap(), c);
            prop_assert_eq!(view.read_f32(24).unwrap(), d);
            prop_assert_eq!(view.read_f64(32).unwrap().to_bits(), e.to_bits());
        }
    }
}
