//! Property tests for the wire codec, packet decoders, ledger folding and
//! the initialization state machine.
//!
//! Decoders take untrusted network input, so the first group only checks
//! that arbitrary bytes never panic.

use hullsync_core::ConnectionId;
use hullsync_net::bitstream::{BitReader, BitWriter};
use hullsync_net::ledger::fold_changes;
use hullsync_net::lifecycle::DEFAULT_PASSWORD_ATTEMPTS;
use hullsync_net::voice::VoicePayload;
use hullsync_net::{
    compute_schema_hash, decode_client_message, decode_client_packet, decode_server_message,
    decode_server_packet, AuthInfo, ClientInitStep, ConnectionLifecycle, ContentPackageList,
    Delta, HandshakePolicy, LifecycleState, StepOutcome, TransportKind, WalletChange,
    WalletSyncMessage, PROTOCOL_VERSION,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn arbitrary_bytes_dont_crash_client_packet(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _ = decode_client_packet(&bytes);
    }

    #[test]
    fn arbitrary_bytes_dont_crash_server_packet(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _ = decode_server_packet(&bytes);
    }

    #[test]
    fn arbitrary_bytes_dont_crash_messages(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decode_client_message(&bytes);
        let _ = decode_server_message(&bytes);
        let _ = VoicePayload::decode(&bytes);
        let _ = WalletSyncMessage::decode(&bytes);
    }
}

proptest! {
    /// Decode error is bounded by one quantization step and re-encoding the
    /// decoded value reproduces the same bits.
    #[test]
    fn ranged_single_within_step(
        lo in -100.0f32..100.0,
        span in 10.0f32..1000.0,
        t in 0.0f32..=1.0,
        bits in 4u32..=12,
    ) {
        let hi = lo + span;
        let value = lo + span * t;

        let mut writer = BitWriter::new();
        writer.write_ranged_single(value, lo, hi, bits);
        let bytes = writer.into_bytes();
        let decoded = BitReader::new(&bytes).read_ranged_single(lo, hi, bits).unwrap();

        let step = (hi - lo) / ((1u64 << bits) as f32);
        prop_assert!(decoded >= lo && decoded <= hi);
        prop_assert!((decoded - value).abs() <= step + 1e-3);

        let mut again = BitWriter::new();
        again.write_ranged_single(decoded, lo, hi, bits);
        prop_assert_eq!(again.into_bytes(), bytes);
    }

    #[test]
    fn ranged_integer_stays_in_range(min in -500i32..500, span in 0i32..5000, raw in any::<u32>()) {
        let max = min + span;
        let mut writer = BitWriter::new();
        writer.write_u32(raw);
        let bytes = writer.into_bytes();
        let value = BitReader::new(&bytes).read_ranged_integer(min, max).unwrap();
        prop_assert!(value >= min && value <= max);
    }

    #[test]
    fn ranged_integer_roundtrip(min in -500i32..500, span in 0i32..5000, t in 0.0f64..=1.0) {
        let max = min + span;
        let value = min + (f64::from(span) * t) as i32;
        let mut writer = BitWriter::new();
        writer.write_ranged_integer(value, min, max);
        let bytes = writer.into_bytes();
        prop_assert_eq!(BitReader::new(&bytes).read_ranged_integer(min, max).unwrap(), value);
    }
}

fn delta_strategy() -> impl Strategy<Value = Delta<i32>> {
    prop_oneof![Just(Delta::Unset), any::<i32>().prop_map(Delta::Set)]
}

fn change_strategy() -> impl Strategy<Value = WalletChange> {
    (delta_strategy(), delta_strategy()).prop_map(|(balance, reward_distribution)| WalletChange {
        balance,
        reward_distribution,
    })
}

proptest! {
    /// Each merged field equals the last `Set` for that field.
    #[test]
    fn ledger_fold_takes_last_set(changes in prop::collection::vec(change_strategy(), 0..20)) {
        let merged = fold_changes(changes.clone());
        let last_balance = changes.iter().rev().find_map(|c| c.balance.value());
        let last_reward = changes.iter().rev().find_map(|c| c.reward_distribution.value());
        prop_assert_eq!(merged.balance.value(), last_balance);
        prop_assert_eq!(merged.reward_distribution.value(), last_reward);
    }
}

fn policy() -> HandshakePolicy {
    HandshakePolicy {
        protocol_version: PROTOCOL_VERSION,
        schema_hash: compute_schema_hash(),
        content: ContentPackageList::new(vec!["Vanilla".to_string()]),
        password: None,
        max_retries: 1000,
        password_attempts: DEFAULT_PASSWORD_ATTEMPTS,
    }
}

fn step_strategy() -> impl Strategy<Value = ClientInitStep> {
    prop_oneof![
        Just(ClientInitStep::Success),
        Just(ClientInitStep::ConnectionStarted),
        Just(ClientInitStep::AuthInfoAndVersion(AuthInfo {
            name: "Diver".to_string(),
            version: PROTOCOL_VERSION,
            schema_hash: compute_schema_hash(),
            owner_key: None,
        })),
        Just(ClientInitStep::ContentPackageOrder(ContentPackageList::new(vec![
            "Vanilla".to_string()
        ]))),
        Just(ClientInitStep::Password { digest: [0; 32] }),
    ]
}

proptest! {
    /// Out-of-order steps reset to `Pending`; `Active` is only reached
    /// straight after `Success` in `ContentPackageNegotiated`.
    #[test]
    fn lifecycle_never_skips_to_active(steps in prop::collection::vec(step_strategy(), 0..40)) {
        let policy = policy();
        let mut lc = ConnectionLifecycle::new(ConnectionId(1), TransportKind::Socket, &policy);
        for step in &steps {
            let before = lc.state();
            let outcome = lc.handle_step(step, &policy);
            match outcome {
                StepOutcome::Retry(_) => prop_assert_eq!(lc.state(), LifecycleState::Pending),
                StepOutcome::Ignored => prop_assert_eq!(before, lc.state()),
                _ => {}
            }
            if lc.state() == LifecycleState::Active && before != LifecycleState::Active {
                prop_assert_eq!(before, LifecycleState::ContentPackageNegotiated);
                prop_assert_eq!(step, &ClientInitStep::Success);
            }
        }
    }
}
