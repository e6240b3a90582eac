use arrayref::array_ref;
use base58::{FromBase58, ToBase58};
use x25519_dalek::{PublicKey, StaticSecret};

/// Deterministic key material for the three parties used across integration tests.
pub struct SeedSet {
    pub alice_seed: [u8; 32],
    pub bob_seed: [u8; 32],
    pub mediator_seed: [u8; 32],
}

pub fn get_seed_set() -> SeedSet {
    let alice = "6QN8DfuN9hjgHgPvLXqgzqYE3jRRGRrmJQZkd5tL8paR".from_base58().unwrap();
    let bob = "HBTcN2MrXNRj9xF9oi8QqYyuEPv3JLLjQKuEgW9oxVKP".from_base58().unwrap();
    let mediator = "ACa4PPJ1LnPNq1iwS33V3Akh7WtnC71WkKFZ9ccM6sX2".from_base58().unwrap();

    SeedSet {
        alice_seed: array_ref!(alice, 0, 32).to_owned(),
        bob_seed: array_ref!(bob, 0, 32).to_owned(),
        mediator_seed: array_ref!(mediator, 0, 32).to_owned(),
    }
}

/// Base58 X25519 public key derived from `seed`, the form used as `kid` in envelopes.
pub fn x25519_fingerprint(seed: &[u8; 32]) -> String {
    let secret = StaticSecret::from(seed.to_owned());
    let public: PublicKey = (&secret).into();
    public.as_bytes().to_base58()
}
