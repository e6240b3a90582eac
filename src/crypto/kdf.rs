use std::convert::TryFrom;

use arrayref::array_ref;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::Error;

/// X25519 Diffie-Hellman between a 32 byte secret and a 32 byte public key.
pub fn diffie_hellman(secret: &[u8], public: &[u8]) -> Result<[u8; 32], Error> {
    if secret.len() < 32 || public.len() < 32 {
        return Err(Error::Generic("X25519 keys must be 32 bytes".to_string()));
    }
    let ss = StaticSecret::from(array_ref!(secret, 0, 32).to_owned())
        .diffie_hellman(&PublicKey::from(array_ref!(public, 0, 32).to_owned()));
    Ok(*ss.as_bytes())
}

/// Creates a key used to encrypt/decrypt keys (key encryption key).
///
/// # Arguments
///
/// * `ze` - ephemeral shared secret zE
///
/// * `zs` - static shared secret zS, `None` for anonymous (ECDH-ES) envelopes
///
/// * `alg` - key wrapping algorithm used
///
/// * `apu` - sender key id for authenticated envelopes
///
/// * `apv` - recipient key id
pub fn generate_kek(
    ze: &[u8],
    zs: Option<&[u8]>,
    alg: &str,
    apu: Option<&str>,
    apv: &str,
) -> Result<Vec<u8>, Error> {
    let mut shared_secret = ze.to_vec();
    if let Some(zs) = zs {
        shared_secret.extend_from_slice(zs);
    }
    let producer = apu.map(|v| v.as_bytes().to_vec());
    let consumer = apv.as_bytes().to_vec();
    concat_kdf(&shared_secret, alg, producer.as_ref(), Some(&consumer))
}

/// Concatenates key derivation function
fn concat_kdf(
    secret: &[u8],
    alg: &str,
    producer_info: Option<&Vec<u8>>,
    consumer_info: Option<&Vec<u8>>,
) -> Result<Vec<u8>, Error> {
    let mut value = get_length_and_input(alg.as_bytes())?;
    if let Some(vector) = producer_info {
        value.extend(get_length_and_input(vector)?);
    } else {
        value.extend(&[0, 0, 0, 0]);
    }
    if let Some(vector) = consumer_info {
        value.extend(get_length_and_input(vector)?);
    } else {
        value.extend(&[0, 0, 0, 0]);
    }
    // only key length 256 is supported
    value.extend(&[0, 0, 1, 0]);

    // since our key length is 256 we only have to do one round
    let mut to_hash: Vec<u8> = vec![0, 0, 0, 1];
    to_hash.extend(secret);
    to_hash.extend(value);

    let mut hasher = Sha256::new();
    hasher.input(&to_hash);
    let hash_result = hasher.result();

    Ok(hash_result.as_slice().to_vec())
}

/// Combines length of array and its its length into a vector.
fn get_length_and_input(vector: &[u8]) -> Result<Vec<u8>, Error> {
    let mut collected: Vec<u8> = u32::try_from(vector.len())
        .map_err(|err| Error::Generic(err.to_string()))?
        .to_be_bytes()
        .to_vec();
    collected.extend(vector);
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kek_depends_on_every_input() -> Result<(), Error> {
        let base = generate_kek(&[1; 32], Some(&[2; 32]), "ECDH-1PU+XC20PKW", Some("a"), "b")?;
        assert_eq!(base.len(), 32);
        assert_ne!(base, generate_kek(&[1; 32], None, "ECDH-1PU+XC20PKW", Some("a"), "b")?);
        assert_ne!(base, generate_kek(&[1; 32], Some(&[2; 32]), "ECDH-ES+XC20PKW", Some("a"), "b")?);
        assert_ne!(base, generate_kek(&[1; 32], Some(&[2; 32]), "ECDH-1PU+XC20PKW", Some("a"), "c")?);
        Ok(())
    }

    #[test]
    fn diffie_hellman_is_symmetric() -> Result<(), Error> {
        let a = StaticSecret::from([7u8; 32]);
        let b = StaticSecret::from([9u8; 32]);
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);
        assert_eq!(
            diffie_hellman(&a.to_bytes(), b_pub.as_bytes())?,
            diffie_hellman(&b.to_bytes(), a_pub.as_bytes())?
        );
        Ok(())
    }
}
