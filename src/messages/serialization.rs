// see https://users.rust-lang.org/t/serialize-a-vec-u8-to-json-as-base64/57781/2
pub(crate) mod base58_buffer {
    use base58::{FromBase58, ToBase58};
    use serde::{Deserialize, Serialize};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        let base58 = v.to_base58();
        String::serialize(&base58, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let base58 = String::deserialize(d)?;
        base58
            .from_base58()
            .map_err(|e| serde::de::Error::custom(format!("invalid base58: {:?}", e)))
    }
}

/// `Duration` as a plain number of milliseconds, the form used in agent configuration.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
