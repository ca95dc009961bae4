use rand::Rng;
use std::time::Duration;

/// Random election timeout within the configured range, so candidates
/// rarely collide.
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_stays_in_range() {
        for _ in 0..100 {
            let t = random_election_timeout(150, 300);
            assert!(t >= Duration::from_millis(150));
            assert!(t <= Duration::from_millis(300));
        }
    }
}
