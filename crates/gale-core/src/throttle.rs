//! Per-source-IP token bucket rate limiting.

use std::{
	collections::HashMap,
	net::IpAddr,
	sync::{Arc, Mutex},
};

use tokio::time::{Duration, Instant, sleep};

/// Token bucket: `consume` refills by elapsed time, caps at
/// `rate x window`, and puts the calling task to sleep once the bucket
/// runs dry. One instance is shared by every session from the same
/// source IP, so parallel connections share the ceiling.
pub struct Throttle {
	/// Tokens (bytes) added per second.
	rate:     f64,
	capacity: f64,
	state:    Mutex<Bucket>,
}

struct Bucket {
	level:      f64,
	last_check: Instant,
}

const DEFAULT_WINDOW: f64 = 0.5;

impl Throttle {
	pub fn new(rate: u64) -> Self {
		Self::with_window(rate, DEFAULT_WINDOW)
	}

	pub fn with_window(rate: u64, window: f64) -> Self {
		let rate = rate.max(1) as f64;
		let capacity = rate * window;
		Throttle {
			rate,
			capacity,
			state: Mutex::new(Bucket {
				level:      capacity,
				last_check: Instant::now(),
			}),
		}
	}

	/// Takes `amount` tokens, sleeping `(1 - bucket) / rate` when the
	/// bucket drops below one token.
	pub async fn consume(&self, amount: u64) {
		let wait = {
			let mut bucket = self.state.lock().unwrap();
			let now = Instant::now();
			let elapsed = now.duration_since(bucket.last_check).as_secs_f64();
			bucket.last_check = now;
			bucket.level = (bucket.level + elapsed * self.rate).min(self.capacity);
			bucket.level -= amount as f64;
			if bucket.level < 1.0 {
				Some(Duration::from_secs_f64((1.0 - bucket.level) / self.rate))
			} else {
				None
			}
		};
		if let Some(wait) = wait {
			sleep(wait).await;
		}
	}

	/// Current token level, clamped to the observable `[0, capacity]`
	/// range (an in-flight oversized consume is represented as empty).
	pub fn level(&self) -> f64 {
		self.state.lock().unwrap().level.clamp(0.0, self.capacity)
	}

	pub fn capacity(&self) -> f64 {
		self.capacity
	}
}

/// Insert-if-missing registry of throttles keyed by source IP.
pub struct ThrottleMap {
	rate:    u64,
	entries: Mutex<HashMap<IpAddr, Arc<Throttle>>>,
}

impl ThrottleMap {
	/// `rate` in bytes per second.
	pub fn new(rate: u64) -> Self {
		ThrottleMap {
			rate,
			entries: Mutex::new(HashMap::new()),
		}
	}

	pub fn get(&self, source: IpAddr) -> Arc<Throttle> {
		let mut entries = self.entries.lock().unwrap();
		entries
			.entry(source)
			.or_insert_with(|| Arc::new(Throttle::new(self.rate)))
			.clone()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn bucket_stays_within_bounds() {
		let throttle = Throttle::new(1000);
		assert!(throttle.level() <= throttle.capacity());
		throttle.consume(100).await;
		assert!(throttle.level() >= 0.0);
		throttle.consume(10_000).await;
		assert!(throttle.level() >= 0.0);
		assert!(throttle.level() <= throttle.capacity());
	}

	#[tokio::test(start_paused = true)]
	async fn saturated_rate_converges() {
		// 10 KiB/s, push 1000 KiB through in 1 KiB reads: the virtual
		// clock should advance close to a hundred seconds.
		let rate = 10 * 1024u64;
		let throttle = Throttle::new(rate);
		let began = Instant::now();
		for _ in 0..1000 {
			throttle.consume(1024).await;
		}
		let elapsed = began.elapsed().as_secs_f64();
		let expect = (1000 * 1024) as f64 / rate as f64;
		assert!(
			(elapsed - expect).abs() / expect < 0.05,
			"elapsed {elapsed}s, expected about {expect}s"
		);
	}

	#[tokio::test(start_paused = true)]
	async fn small_reads_below_capacity_never_block() {
		let throttle = Throttle::new(1_000_000);
		let began = Instant::now();
		throttle.consume(100).await;
		throttle.consume(100).await;
		assert_eq!(began.elapsed(), Duration::ZERO);
	}

	#[tokio::test]
	async fn map_shares_buckets_per_ip() {
		let map = ThrottleMap::new(1000);
		let a1 = map.get("10.0.0.1".parse().unwrap());
		let a2 = map.get("10.0.0.1".parse().unwrap());
		let b = map.get("10.0.0.2".parse().unwrap());
		assert!(Arc::ptr_eq(&a1, &a2));
		assert!(!Arc::ptr_eq(&a1, &b));
	}
}
