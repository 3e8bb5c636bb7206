//! Writing wire values into caller-provided buffers.

use bytes::Bytes;

#[derive(Debug, PartialEq, Eq)]
pub struct EncodingError;

/// Serializes a value into the caller's buffer, returning the written prefix.
pub trait Encodable {
    fn encoded_len(&self) -> usize;

    fn encode<'a>(&self, into: &'a mut [u8]) -> Result<&'a [u8], EncodingError>;

    fn to_bytes(&self) -> Result<Bytes, EncodingError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let len = self.encode(&mut buf)?.len();
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }
}

/// A value stored in some bits of a single byte, e.g. the mode in the top
/// three bits of the setpoint byte.
pub trait BitField {
    const SHIFT: u8;
    const MASK: u8;

    fn field_value(&self) -> u8;
}

/// Implements [`Encodable`] for [`BitField`] types. Encoding merges the field
/// into the one-byte buffer and keeps the bits around it.
#[macro_export]
macro_rules! bit_field_encodable {
    ( $( $field:ty ),* ) => {
        $(
            impl $crate::protocol::encoding::Encodable for $field {
                fn encoded_len(&self) -> usize {
                    1
                }

                fn encode<'a>(
                    &self,
                    into: &'a mut [u8],
                ) -> ::core::result::Result<&'a [u8], $crate::protocol::encoding::EncodingError> {
                    use $crate::protocol::encoding::{BitField, EncodingError};

                    if into.len() != 1 {
                        return Err(EncodingError);
                    }
                    let mask = <$field as BitField>::MASK << <$field as BitField>::SHIFT;
                    into[0] = (into[0] & !mask) | ((self.field_value() << <$field as BitField>::SHIFT) & mask);
                    Ok(into)
                }
            }
        )*
    }
}
