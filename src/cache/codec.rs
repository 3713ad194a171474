//! Entry encoding for the serialized tiers
//!
//! Off-heap and disk entries are stored bincode-encoded. Encoding
//! failures surface as `SerializationError` on the operation that
//! triggered them; decode failures as `DeserializationError`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::CacheError;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|err| CacheError::serialization(err.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|err| CacheError::deserialization(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let bytes = encode(&(42u64, "answer".to_string())).unwrap();
        let (num, text): (u64, String) = decode(&bytes).unwrap();
        assert_eq!(num, 42);
        assert_eq!(text, "answer");
    }

    #[test]
    fn truncated_input_is_a_deserialization_error() {
        let bytes = encode(&"a longer string than one byte".to_string()).unwrap();
        let err = decode::<String>(&bytes[..1]).unwrap_err();
        assert!(matches!(err, CacheError::DeserializationError(_)));
    }
}
