use beam_pipe::secret::WORDS;
use beam_pipe::{accepts, KeyDerivation, Role, SharedSecret, LONG_DRIFT, SHORT_DRIFT};
use proptest::prelude::*;

const SHORT: u64 = SHORT_DRIFT.as_millis() as u64;
const LONG: u64 = LONG_DRIFT.as_millis() as u64;

/// Timestamps between 2001 and 2096, in milliseconds.
const EPOCH_RANGE: std::ops::Range<u64> = 1_000_000_000_000..4_000_000_000_000;

fn secret() -> impl Strategy<Value = SharedSecret> {
    prop::collection::vec(0..WORDS.len(), 4..10).prop_map(|indices| {
        let phrase: Vec<&str> = indices.into_iter().map(|i| WORDS[i]).collect();
        SharedSecret::parse(&phrase.join(" ")).expect("word-list phrase")
    })
}

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Responder), Just(Role::Initiator)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Clocks less than one window apart share a candidate keypair.
    #[test]
    fn skew_within_one_window_overlaps(
        secret in secret(),
        role in role(),
        t1 in EPOCH_RANGE,
        skew in 0..SHORT,
    ) {
        let d = KeyDerivation::new(secret);
        let a = d.auth_identities(role, t1);
        let b = d.auth_identities(role, t1 + skew);
        prop_assert!(a.iter().any(|key| accepts(&b, key)));
    }

    /// Whatever the skew direction, the peer's presented identity passes
    /// the acceptance check computed on our clock.
    #[test]
    fn presented_identity_accepted_under_skew(
        secret in secret(),
        t in EPOCH_RANGE,
        skew in 0..SHORT,
        initiator_ahead in any::<bool>(),
    ) {
        let d = KeyDerivation::new(secret);
        let (responder_now, initiator_now) = if initiator_ahead {
            (t, t + skew)
        } else {
            (t + skew, t)
        };

        let presented = d.auth_identities(Role::Initiator, initiator_now)[1];
        let expected = d.auth_identities(Role::Initiator, responder_now);
        prop_assert!(accepts(&expected, &presented));

        let advertised = d.auth_identities(Role::Responder, responder_now)[1];
        let wanted = d.auth_identities(Role::Responder, initiator_now);
        prop_assert!(accepts(&wanted, &advertised));
    }

    /// Three or more windows apart, the candidate sets are disjoint.
    #[test]
    fn stale_windows_are_disjoint(
        secret in secret(),
        role in role(),
        t1 in EPOCH_RANGE,
        extra in 0..(10 * SHORT),
    ) {
        let d = KeyDerivation::new(secret);
        let a = d.auth_identities(role, t1);
        let b = d.auth_identities(role, t1 + 3 * SHORT + extra);
        prop_assert!(a.iter().all(|key| !accepts(&b, key)));
    }

    /// A responder key is never a valid initiator key and vice versa.
    #[test]
    fn roles_never_collide(
        secret in secret(),
        t in EPOCH_RANGE,
    ) {
        let d = KeyDerivation::new(secret);
        let responder = d.auth_identities(Role::Responder, t);
        let initiator = d.auth_identities(Role::Initiator, t);
        prop_assert!(initiator.iter().all(|key| !accepts(&responder, key)));
    }

    /// Both peers agree on topics anywhere inside one long window, and the
    /// "next" topic becomes the "current" one after the boundary.
    #[test]
    fn discovery_ids_roll_forward(
        secret in secret(),
        t in EPOCH_RANGE,
        offset in 0..LONG,
    ) {
        let d = KeyDerivation::new(secret);
        let start = t - t % LONG;
        prop_assert_eq!(d.discovery_ids(start), d.discovery_ids(start + offset));
        prop_assert_eq!(d.discovery_ids(start)[1], d.discovery_ids(start + LONG)[0]);
    }
}
