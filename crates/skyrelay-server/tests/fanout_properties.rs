//! Property-based tests for fan-out.
//!
//! For any mix of client subscriptions, a driver update reaches every
//! subscribed client exactly once and nobody else.

mod common;

use common::Harness;
use proptest::prelude::*;

const DEVICES: [&str; 3] = ["Mount", "Camera", "Focuser"];

/// What a generated client asked for.
#[derive(Debug, Clone, Copy)]
enum Interest {
    Nothing,
    Everything,
    Device(usize),
}

fn interest() -> impl Strategy<Value = Interest> {
    prop_oneof![
        Just(Interest::Nothing),
        Just(Interest::Everything),
        (0..DEVICES.len()).prop_map(Interest::Device),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: each update is delivered once to each interested client and
    /// never to the others
    #[test]
    fn prop_update_reaches_exactly_interested_clients(
        interests in prop::collection::vec(interest(), 1..8),
        updates in prop::collection::vec(0..DEVICES.len(), 1..10),
    ) {
        let mut h = Harness::with_defaults();
        let driver = h.driver("indi_multi");

        let clients: Vec<_> = interests
            .iter()
            .map(|interest| {
                let conn = h.client();
                match interest {
                    Interest::Nothing => {},
                    Interest::Everything => h.send(conn, "<getProperties version='1.7'/>"),
                    Interest::Device(d) => {
                        h.send(conn, &format!("<getProperties version='1.7' device='{}'/>", DEVICES[*d]));
                    },
                }
                conn
            })
            .collect();

        for &d in &updates {
            h.send(
                driver,
                &format!("<setNumberVector device='{}' name='P'><oneNumber name='V'>1</oneNumber></setNumberVector>", DEVICES[d]),
            );
        }

        for (conn, interest) in clients.iter().zip(&interests) {
            let out = h.take(*conn);
            for (d, device) in DEVICES.iter().enumerate() {
                let sent = updates.iter().filter(|&&u| u == d).count();
                let expected = match interest {
                    Interest::Nothing => 0,
                    Interest::Everything => sent,
                    Interest::Device(sub) => if *sub == d { sent } else { 0 },
                };
                let needle = format!("<setNumberVector device='{device}'");
                prop_assert_eq!(out.matches(&needle).count(), expected);
            }
        }
    }
}
