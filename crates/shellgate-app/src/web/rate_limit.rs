use dashmap::DashMap;
use shellgate_types::GateError;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: f64,
    last_seen: Instant,
}

/// Per-client-address connection admission.
///
/// Each address may open `max` connections; once `cooldown` has passed since
/// its last accepted connection the count drains linearly at
/// `max / cooldown`. Refused attempts neither count nor refresh the window.
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    max: u32,
    cooldown: Duration,
    clients: DashMap<IpAddr, Bucket>,
}

impl ConnectionRateLimiter {
    pub fn new(max: u32, cooldown: Duration) -> Self {
        Self {
            max: max.max(1),
            cooldown,
            clients: DashMap::new(),
        }
    }

    /// Admit or refuse a new connection from `ip`
    pub fn check(&self, ip: IpAddr) -> Result<(), GateError> {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), GateError> {
        let max = self.max as f64;
        let mut entry = self.clients.entry(ip).or_insert(Bucket {
            count: 0.0,
            last_seen: now,
        });
        let bucket = entry.value_mut();
        let elapsed = now.saturating_duration_since(bucket.last_seen);
        let count = self.decayed(bucket.count, elapsed);

        if count + 1.0 > max {
            let excess = count + 1.0 - max;
            let drain = self.cooldown.as_secs_f64() * excess / max;
            let wait = self.cooldown.saturating_sub(elapsed).as_secs_f64() + drain;
            let retry_after_ms = (wait * 1000.0).ceil() as u64;
            debug!(client = %ip, retry_after_ms, "connection refused by rate limit");
            return Err(GateError::ConnectionRateLimited { retry_after_ms });
        }

        bucket.count = count + 1.0;
        bucket.last_seen = now;
        Ok(())
    }

    /// Drop addresses whose count has fully drained
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_seen);
            self.decayed(bucket.count, elapsed) > 0.0
        });
        before - self.clients.len()
    }

    pub fn tracked(&self) -> usize {
        self.clients.len()
    }

    fn decayed(&self, count: f64, elapsed: Duration) -> f64 {
        let Some(draining) = elapsed.checked_sub(self.cooldown) else {
            return count;
        };
        let cooldown = self.cooldown.as_secs_f64();
        if cooldown == 0.0 {
            return 0.0;
        }
        let drained = self.max as f64 * draining.as_secs_f64() / cooldown;
        (count - drained).max(0.0)
    }
}
