//! Order in which a minion tries its masters.

use brine_config::MasterType;
use rand::seq::SliceRandom;
use rand::Rng;

/// Index of the preferred master for `distributed` mode.
pub fn distributed_index(id: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    crc32fast::hash(id.as_bytes()) as usize % len
}

/// The master list in attempt order.
///
/// - `distributed`: rotated so the hashed preference comes first.
/// - `random_master`: shuffled; with `failback` the primary stays first and
///   only the rest is shuffled.
pub fn ordered_masters<R: Rng + ?Sized>(
    masters: &[String],
    master_type: MasterType,
    random_master: bool,
    failback: bool,
    id: &str,
    rng: &mut R,
) -> Vec<String> {
    let mut ordered = masters.to_vec();
    if ordered.len() < 2 {
        return ordered;
    }
    match master_type {
        MasterType::Distributed => {
            let start = distributed_index(id, ordered.len());
            ordered.rotate_left(start);
        }
        MasterType::Failover | MasterType::Str if random_master => {
            if failback {
                ordered[1..].shuffle(rng);
            } else {
                ordered.shuffle(rng);
            }
        }
        _ => {}
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("m{i}")).collect()
    }

    #[test]
    fn plain_failover_keeps_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let got = ordered_masters(&names(3), MasterType::Failover, false, false, "a", &mut rng);
        assert_eq!(got, names(3));
    }

    #[test]
    fn failback_pins_primary() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let got = ordered_masters(&names(5), MasterType::Failover, true, true, "a", &mut rng);
            assert_eq!(got[0], "m1");
            let mut sorted = got.clone();
            sorted.sort();
            assert_eq!(sorted, names(5));
        }
    }

    #[test]
    fn distributed_uses_crc32() {
        let masters = names(3);
        let idx = distributed_index("web01", 3);
        assert_eq!(idx, crc32fast::hash(b"web01") as usize % 3);
        let mut rng = StdRng::seed_from_u64(1);
        let got = ordered_masters(&masters, MasterType::Distributed, false, false, "web01", &mut rng);
        assert_eq!(got[0], masters[idx]);
        assert_eq!(got.len(), 3);
    }
}
