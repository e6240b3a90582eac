use std::sync::Arc;

use didcomm_agent::{
    crypto::CryptoAlgorithm,
    envelope::{EnvelopeKeys, EnvelopeService, Jwe},
    messages::{PlaintextMessage, ReturnRoute},
    protocols::{routing::Forward, trust_ping::Ping},
    wallet::{InMemoryWallet, Key, KeyType, Wallet},
    Error, Result,
};
use quickcheck_macros::quickcheck;
use serde_json::Value;
use utilities::{get_seed_set, x25519_fingerprint, SeedSet};

struct Party {
    wallet: Arc<InMemoryWallet>,
    envelope: EnvelopeService,
    key: Key,
}

async fn party(seed: &[u8; 32], algorithm: CryptoAlgorithm) -> Result<Party> {
    let wallet = Arc::new(InMemoryWallet::new(algorithm));
    let key = wallet.create_key(KeyType::X25519, Some(seed)).await?;
    Ok(Party {
        envelope: EnvelopeService::new(wallet.clone()),
        wallet,
        key,
    })
}

fn ping(comment: &str) -> Result<PlaintextMessage> {
    PlaintextMessage::new(&Ping {
        response_requested: true,
        comment: Some(comment.to_string()),
    })
}

fn flip_tag_bit(jwe: &mut Jwe) -> Result<()> {
    let mut tag = base64_url::decode(&jwe.tag)?;
    tag[0] ^= 0x01;
    jwe.tag = base64_url::encode(&tag);
    Ok(())
}

#[tokio::test]
async fn authcrypt_round_trip_identifies_sender() -> Result<()> {
    // Arrange
    let SeedSet {
        alice_seed,
        bob_seed,
        ..
    } = get_seed_set();
    let alice = party(&alice_seed, CryptoAlgorithm::XC20P).await?;
    let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
    let message = ping("hello bob")?.set_return_route(ReturnRoute::Thread);
    let keys = EnvelopeKeys {
        recipient_keys: vec![bob.key.clone()],
        routing_keys: vec![],
        sender_key: Some(alice.key.clone()),
    };

    // Act
    let jwe = alice.envelope.pack(&message, &keys).await?;
    let unpacked = bob.envelope.unpack(&jwe.to_bytes()?).await?;

    // Assert
    assert_eq!(unpacked.message, message);
    assert_eq!(unpacked.sender_key.as_ref(), Some(&alice.key));
    assert_eq!(unpacked.recipient_key.as_ref(), Some(&bob.key));
    assert_eq!(jwe.recipient_kids(), vec![x25519_fingerprint(&bob_seed).as_str()]);
    assert_eq!(jwe.protected_header()?.skid, Some(alice.key.fingerprint()));
    Ok(())
}

#[tokio::test]
async fn anoncrypt_hides_sender() -> Result<()> {
    // Arrange
    let SeedSet { bob_seed, .. } = get_seed_set();
    let bob = party(&bob_seed, CryptoAlgorithm::A256GCM).await?;
    let message = ping("from nobody")?;
    let keys = EnvelopeKeys {
        recipient_keys: vec![bob.key.clone()],
        routing_keys: vec![],
        sender_key: None,
    };

    // Act
    let jwe = bob.envelope.pack(&message, &keys).await?;
    let unpacked = bob.envelope.unpack(&jwe.to_bytes()?).await?;

    // Assert
    assert_eq!(unpacked.message, message);
    assert!(unpacked.sender_key.is_none());
    assert!(jwe.protected_header()?.skid.is_none());
    Ok(())
}

#[tokio::test]
async fn flipped_tag_bit_fails_closed() -> Result<()> {
    // Arrange
    let SeedSet {
        alice_seed,
        bob_seed,
        ..
    } = get_seed_set();
    let alice = party(&alice_seed, CryptoAlgorithm::XC20P).await?;
    let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
    let keys = EnvelopeKeys {
        recipient_keys: vec![bob.key.clone()],
        routing_keys: vec![],
        sender_key: Some(alice.key.clone()),
    };
    let mut jwe = alice.envelope.pack(&ping("tampered")?, &keys).await?;

    // Act
    flip_tag_bit(&mut jwe)?;
    let result = bob.envelope.unpack(&jwe.to_bytes()?).await;

    // Assert
    assert!(matches!(result, Err(Error::Decryption(_))));
    Ok(())
}

#[tokio::test]
async fn envelope_for_someone_else_is_rejected() -> Result<()> {
    let SeedSet {
        alice_seed,
        bob_seed,
        mediator_seed,
    } = get_seed_set();
    let alice = party(&alice_seed, CryptoAlgorithm::XC20P).await?;
    let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
    let mediator = party(&mediator_seed, CryptoAlgorithm::XC20P).await?;
    let keys = EnvelopeKeys {
        recipient_keys: vec![bob.key.clone()],
        routing_keys: vec![],
        sender_key: Some(alice.key.clone()),
    };
    let jwe = alice.envelope.pack(&ping("not yours")?, &keys).await?;
    let result = mediator.envelope.unpack(&jwe.to_bytes()?).await;
    assert!(matches!(result, Err(Error::Decryption(_))));
    assert!(!mediator.wallet.has_key(&bob.key));
    Ok(())
}

#[tokio::test]
async fn routing_key_wraps_message_in_forward() -> Result<()> {
    // Arrange
    let SeedSet {
        alice_seed,
        bob_seed,
        mediator_seed,
    } = get_seed_set();
    let alice = party(&alice_seed, CryptoAlgorithm::XC20P).await?;
    let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
    let mediator = party(&mediator_seed, CryptoAlgorithm::XC20P).await?;
    let message = ping("through the mediator")?;
    let keys = EnvelopeKeys {
        recipient_keys: vec![bob.key.clone()],
        routing_keys: vec![mediator.key.clone()],
        sender_key: Some(alice.key.clone()),
    };

    // Act
    let jwe = alice.envelope.pack(&message, &keys).await?;
    let outer = mediator.envelope.unpack(&jwe.to_bytes()?).await?;
    let forward: Forward = outer.message.decode()?;
    let inner = bob.envelope.unpack_value(&forward.msg).await?;

    // Assert
    assert!(outer.sender_key.is_none());
    assert_eq!(forward.to, bob.key.fingerprint());
    assert_eq!(inner.message, message);
    assert_eq!(inner.sender_key.as_ref(), Some(&alice.key));
    Ok(())
}

#[tokio::test]
async fn plaintext_json_passes_through() -> Result<()> {
    let SeedSet { bob_seed, .. } = get_seed_set();
    let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
    let message = ping("in the clear")?;
    let unpacked = bob.envelope.unpack(&message.to_bytes()?).await?;
    assert_eq!(unpacked.message, message);
    assert!(unpacked.recipient_key.is_none());
    let wire: Value = serde_json::from_slice(&message.to_bytes()?)?;
    assert!(!Jwe::is_envelope(&wire));
    Ok(())
}

#[quickcheck]
fn any_comment_survives_round_trip(comment: String) -> bool {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return false,
    };
    runtime
        .block_on(async {
            let SeedSet {
                alice_seed,
                bob_seed,
                ..
            } = get_seed_set();
            let alice = party(&alice_seed, CryptoAlgorithm::XC20P).await?;
            let bob = party(&bob_seed, CryptoAlgorithm::XC20P).await?;
            let message = ping(&comment)?;
            let keys = EnvelopeKeys {
                recipient_keys: vec![bob.key.clone()],
                routing_keys: vec![],
                sender_key: Some(alice.key.clone()),
            };
            let jwe = alice.envelope.pack(&message, &keys).await?;
            let unpacked = bob.envelope.unpack(&jwe.to_bytes()?).await?;
            Ok::<bool, Error>(unpacked.message == message)
        })
        .unwrap_or(false)
}
