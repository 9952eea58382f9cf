/// Base64 helpers shared by the envelope codecs.
pub mod base64 {
    use ::base64::engine::general_purpose::STANDARD;
    use ::base64::{DecodeError, Engine};

    #[inline]
    pub fn encode<T: AsRef<[u8]>>(data: T) -> String {
        STANDARD.encode(data)
    }

    #[inline]
    pub fn decode<T: AsRef<[u8]>>(data: T) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_round_trip() {
        let bytes = [0u8, 1, 2, 253, 254, 255];
        assert_eq!(base64::decode(base64::encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(base64::decode("not b64!").is_err());
    }
}
