//! Background maintenance: periodic idle sweeps and configuration reloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::AuthguardError;
use crate::ratelimit::{BucketBackend, RateLimiter, RateLimiterConfig};

fn ticker(period: Duration) -> IntervalStream {
    IntervalStream::new(interval_at(Instant::now() + period, period))
}

/// Sweep idle buckets every `period`.
pub fn spawn_sweeper<B: BucketBackend + 'static>(
    limiter: Arc<RateLimiter<B>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_ms = period.as_millis() as u64, "Idle bucket sweeper started");
        let mut ticks = ticker(period);
        while ticks.next().await.is_some() {
            match limiter.sweep().await {
                Ok(removed) => debug!(removed = removed, "Sweep finished"),
                Err(e) => warn!(error = %e, "Sweep failed"),
            }
        }
    })
}

/// Re-read the document at `path` and publish it if it differs from the live
/// one. An invalid document is logged violation by violation and the live
/// configuration is kept.
///
/// Returns whether a new configuration was published.
pub async fn reload_from_file<B: BucketBackend>(limiter: &RateLimiter<B>, path: &Path) -> bool {
    let loaded = match tokio::fs::read_to_string(path).await {
        Ok(contents) => RateLimiterConfig::from_contents(path, &contents),
        Err(e) => Err(AuthguardError::Io(e)),
    };
    match loaded {
        Ok(config) => {
            if *limiter.config() == config {
                debug!(path = %path.display(), "Rate limiter configuration unchanged");
                return false;
            }
            limiter.reload(config);
            true
        }
        Err(AuthguardError::InvalidRules(e)) => {
            for violation in &e.violations {
                error!(path = %path.display(), violation = %violation, "Invalid rate limiter configuration");
            }
            warn!(
                path = %path.display(),
                violations = e.violations.len(),
                "Reload rejected, keeping previous configuration"
            );
            false
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Reload failed, keeping previous configuration");
            false
        }
    }
}

#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(sig) => Self(Some(sig)),
            Err(e) => {
                warn!(error = %e, "Could not install SIGHUP handler, reload on signal disabled");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) -> Option<()> {
        match &mut self.0 {
            Some(sig) => sig.recv().await,
            None => None,
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn install() -> Self {
        Hangup
    }

    async fn recv(&mut self) -> Option<()> {
        None
    }
}

async fn next_tick(ticks: &mut Option<IntervalStream>) -> Option<()> {
    match ticks {
        Some(ticks) => ticks.next().await.map(|_| ()),
        None => None,
    }
}

/// Reload the document at `path` on SIGHUP and, if `period` is set, on a timer.
pub fn spawn_reloader<B: BucketBackend + 'static>(
    limiter: Arc<RateLimiter<B>>,
    path: PathBuf,
    period: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = period.map(ticker);
        let mut hangup = Hangup::install();

        info!(
            path = %path.display(),
            period_secs = period.map(|p| p.as_secs()),
            "Configuration reloader started"
        );

        loop {
            let trigger = tokio::select! {
                Some(()) = next_tick(&mut ticks) => "interval",
                Some(()) = hangup.recv() => "sighup",
                else => break,
            };
            debug!(trigger = trigger, "Reloading rate limiter configuration");
            reload_from_file(&limiter, &path).await;
        }

        info!("Configuration reloader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BucketConfig, BucketStore, Dimension, Identifiers, ManualClock, RouteId};

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn initial() -> RateLimiterConfig {
        RateLimiterConfig::new(BucketConfig::try_new(10, 100).unwrap())
    }

    #[tokio::test]
    async fn test_reload_publishes_new_config() {
        let limiter = RateLimiter::new(initial());
        let path = write_temp(
            "limits.json",
            r#"{ "enabled": true, "defaultBuckets": { "globalBucket": { "capacity": 50, "addTokenMs": 20 } } }"#,
        );

        assert!(reload_from_file(&limiter, &path).await);
        assert_eq!(limiter.generation(), 2);
        let global = limiter.config().default_buckets().bucket(Dimension::Global).copied();
        assert_eq!(global, BucketConfig::try_new(50, 20));

        // Same document again is not republished.
        assert!(!reload_from_file(&limiter, &path).await);
        assert_eq!(limiter.generation(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_config() {
        let limiter = RateLimiter::new(initial());
        let path = write_temp(
            "limits.yaml",
            "enabled: true\ndefaultBuckets:\n  globalBucket:\n    capacity: -1\n    addTokenMs: 10\n",
        );

        assert!(!reload_from_file(&limiter, &path).await);
        assert_eq!(limiter.generation(), 1);
        assert_eq!(*limiter.config(), initial());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_keeps_previous_config() {
        let limiter = RateLimiter::new(initial());
        assert!(!reload_from_file(&limiter, Path::new("/nonexistent/authguard/limits.json")).await);
        assert_eq!(limiter.generation(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_idle_buckets() {
        let clock = ManualClock::new(0);
        let limiter = Arc::new(
            RateLimiter::with_backend(initial(), BucketStore::new()).with_clock(Arc::new(clock.clone())),
        );
        limiter.check(RouteId::SignIn, &Identifiers::new()).await;
        assert_eq!(limiter.backend().len(), 1);

        clock.advance(10_000);
        let handle = spawn_sweeper(Arc::clone(&limiter), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(limiter.backend().is_empty());
    }

    #[tokio::test]
    async fn test_reloader_picks_up_changes_on_interval() {
        let limiter = Arc::new(RateLimiter::new(initial()));
        let path = write_temp(
            "limits.json",
            r#"{ "enabled": false, "defaultBuckets": { "globalBucket": { "capacity": 10, "addTokenMs": 100 } } }"#,
        );

        let handle = spawn_reloader(Arc::clone(&limiter), path.clone(), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(!limiter.config().enabled());
        std::fs::remove_file(&path).unwrap();
    }
}
