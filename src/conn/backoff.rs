//! Reconnect backoff and fallback-host rotation.

/// Doubling backoff from a configured base, capped at `MAX_DELAY_MS`.
///
/// Reset whenever a connection is successfully established.
#[derive(Debug)]
pub(crate) struct Backoff {
    base_ms: u64,
    attempt: u32,
}

const MAX_DELAY_MS: u64 = 60_000;

impl Backoff {
    pub(crate) fn new(base_ms: u64) -> Self {
        Backoff {
            base_ms,
            attempt: 0,
        }
    }

    /// Delay for the next attempt, then advance.
    pub(crate) fn next_delay_ms(&mut self) -> u64 {
        let factor = 1u64 << self.attempt.min(6);
        self.attempt = self.attempt.saturating_add(1);
        (self.base_ms.saturating_mul(factor)).min(MAX_DELAY_MS)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Round-robin over the primary host plus configured fallbacks.
#[derive(Debug)]
pub(crate) struct HostRotation {
    hosts: Vec<String>,
    index: usize,
}

impl HostRotation {
    /// `primary_url` is used verbatim; fallbacks are host names substituted
    /// into it.
    pub(crate) fn new(primary_url: String, fallback_hosts: &[String]) -> Self {
        let mut hosts = vec![primary_url.clone()];
        for host in fallback_hosts {
            hosts.push(replace_host(&primary_url, host));
        }
        HostRotation { hosts, index: 0 }
    }

    /// URL for the current attempt.
    pub(crate) fn current(&self) -> &str {
        &self.hosts[self.index % self.hosts.len()]
    }

    /// Rotate to the next host after a failed attempt.
    pub(crate) fn advance(&mut self) {
        self.index = (self.index + 1) % self.hosts.len();
    }

    pub(crate) fn reset(&mut self) {
        self.index = 0;
    }
}

/// Swap the authority of `url` for `host`, keeping scheme, path and query.
fn replace_host(url: &str, host: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return format!("wss://{host}");
    };
    let (scheme, rest) = url.split_at(scheme_end + 3);
    let path_start = rest
        .find(['/', '?'])
        .map_or(rest.len(), |i| i);
    format!("{scheme}{host}{}", &rest[path_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(1_000);
        assert_eq!(backoff.next_delay_ms(), 1_000);
        assert_eq!(backoff.next_delay_ms(), 2_000);
        assert_eq!(backoff.next_delay_ms(), 4_000);
        for _ in 0..10 {
            let delay = backoff.next_delay_ms();
            assert!(delay <= MAX_DELAY_MS);
        }
        backoff.reset();
        assert_eq!(backoff.next_delay_ms(), 1_000);
    }

    #[test]
    fn host_rotation_walks_fallbacks() {
        let mut rotation = HostRotation::new(
            "wss://rt.example.com/ws?x=1".to_owned(),
            &["b.example.com".to_owned()],
        );
        assert_eq!(rotation.current(), "wss://rt.example.com/ws?x=1");
        rotation.advance();
        assert_eq!(rotation.current(), "wss://b.example.com/ws?x=1");
        rotation.advance();
        assert_eq!(rotation.current(), "wss://rt.example.com/ws?x=1");
        rotation.reset();
        assert_eq!(rotation.current(), "wss://rt.example.com/ws?x=1");
    }

    #[test]
    fn replace_host_handles_bare_authority() {
        assert_eq!(
            replace_host("wss://a.example.com", "b.example.com"),
            "wss://b.example.com"
        );
    }
}
