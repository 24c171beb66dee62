use super::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn data() -> Hash {
    Hash::keccak(&[0xa1, 0xa2, 0xa3, 0xa4])
}

fn signer(seed: u64) -> RootSigner {
    // Do not use that on any real device, this is just for testing.
    let mut rng = StdRng::seed_from_u64(seed);
    let bytes: [u8; 32] = rng.gen();
    RootSigner::from_seed(&bytes).unwrap()
}

macro_rules! make_sign_recover {
    ($name:ident, $seed:literal, $app_seq_no:literal) => {
        #[tokio::test]
        async fn $name() {
            let signer = signer($seed);
            let sig = signer.sign(data(), $app_seq_no).await.unwrap();

            assert!(matches!(sig.0[64], 27 | 28));
            assert_eq!(
                recover_signer(data(), sig).unwrap(),
                signer.address($app_seq_no).unwrap()
            );
        }
    };
}

make_sign_recover!(sign_recover_free_balance, 0, 0);
make_sign_recover!(sign_recover_first_app, 0, 1);
make_sign_recover!(sign_recover_other_root, 42, 7);

#[tokio::test]
async fn signing_is_deterministic() {
    let signer = signer(3);
    let a = signer.sign(data(), 5).await.unwrap();
    let b = signer.sign(data(), 5).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn ephemeral_keys_are_per_app() {
    let signer = signer(3);
    let sig = signer.sign(data(), 5).await.unwrap();
    let recovered = recover_signer(data(), sig).unwrap();
    assert_ne!(recovered, signer.address(6).unwrap());
}

#[tokio::test]
async fn signature_over_other_digest_does_not_recover() {
    let signer = signer(9);
    let sig = signer.sign(data(), 1).await.unwrap();
    let recovered = recover_signer(Hash::keccak(b"other"), sig).unwrap();
    assert_ne!(recovered, signer.address(1).unwrap());
}

#[test]
fn invalid_recovery_byte() {
    let sig = Signature([0x11; 65]);
    assert!(matches!(
        recover_signer(data(), sig),
        Err(Error::InvalidRecoveryId(0x11))
    ));
}

#[test]
fn root_identifier_is_seeded() {
    assert_eq!(
        signer(1).public_identifier(),
        signer(1).public_identifier()
    );
    assert_ne!(
        signer(1).public_identifier(),
        signer(2).public_identifier()
    );
}
