//! Process-wide cache metrics with Prometheus text exposition.
//!
//! Counters and gauges are plain atomics; the request-duration histogram uses
//! 20 exponential buckets from 10µs (doubling up to ~5.2s). No Prometheus
//! client dependency: [`Metrics::render`] emits the text exposition format
//! and [`serve_metrics`] answers `GET /metrics` scrapes over a minimal HTTP
//! listener.
//!
//! Metric naming conventions:
//! - all metrics are prefixed with `distcache_`,
//! - counters use the `_total` suffix,
//! - durations are reported in seconds,
//! - every series carries an `instance` label (hostname).

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

const BUCKET_COUNT: usize = 20;

/// Operation label recorded on the duration histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Local cache lookup.
    Get,
    /// Local retrieval and cache population.
    Put,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Put => "put",
        }
    }
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: [AtomicU64; BUCKET_COUNT],
    count: AtomicU64,
    sum_nanos: AtomicU64,
}

impl Histogram {
    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (i, bucket) in self.buckets.iter().enumerate() {
            if seconds <= bucket_bound(i) {
                bucket.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Upper bound of bucket `i` in seconds: 10µs × 2^i.
fn bucket_bound(i: usize) -> f64 {
    0.00001 * (1u64 << i) as f64
}

/// Counters, gauges and histograms for one cache process.
#[derive(Debug, Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    requests: AtomicU64,
    backing_store_hits: AtomicU64,
    backing_store_misses: AtomicU64,
    size_bytes: AtomicU64,
    items: AtomicU64,
    get_duration: Histogram,
    put_duration: Histogram,
}

static GLOBAL: OnceLock<Metrics> = OnceLock::new();

fn instance_name() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()))
}

impl Metrics {
    /// The process-wide metrics instance.
    pub fn global() -> &'static Metrics {
        GLOBAL.get_or_init(Metrics::default)
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backing_store_hit(&self) {
        self.backing_store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backing_store_miss(&self) {
        self.backing_store_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_size(&self, bytes: u64) {
        self.size_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_item_count(&self, items: u64) {
        self.items.store(items, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, operation: Operation, duration: Duration) {
        match operation {
            Operation::Get => self.get_duration.observe(duration),
            Operation::Put => self.put_duration.observe(duration),
        }
    }

    /// Snapshot of the hit counter, used by tests.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Snapshot of the miss counter, used by tests.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Renders all series in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let instance = instance_name();
        let mut out = String::with_capacity(2048);

        let counters = [
            ("distcache_hits_total", "The total number of cache hits", &self.hits),
            ("distcache_misses_total", "The total number of cache misses", &self.misses),
            ("distcache_evictions_total", "The total number of cache evictions", &self.evictions),
            ("distcache_requests_total", "The total number of requests received", &self.requests),
            (
                "distcache_backing_store_hits_total",
                "Loads answered by the backing store",
                &self.backing_store_hits,
            ),
            (
                "distcache_backing_store_misses_total",
                "Loads the backing store could not answer",
                &self.backing_store_misses,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(
                out,
                "{name}{{instance=\"{instance}\"}} {}",
                counter.load(Ordering::Relaxed)
            );
        }

        let gauges = [
            ("distcache_size_bytes", "The current size of the cache in bytes", &self.size_bytes),
            ("distcache_items_total", "The total number of items in the cache", &self.items),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(
                out,
                "{name}{{instance=\"{instance}\"}} {}",
                gauge.load(Ordering::Relaxed)
            );
        }

        let name = "distcache_request_duration_seconds";
        let _ = writeln!(out, "# HELP {name} Time spent processing cache requests");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (operation, histogram) in [
            (Operation::Get, &self.get_duration),
            (Operation::Put, &self.put_duration),
        ] {
            let op = operation.label();
            let mut cumulative = 0u64;
            for i in 0..BUCKET_COUNT {
                cumulative += histogram.buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "{name}_bucket{{operation=\"{op}\",instance=\"{instance}\",le=\"{}\"}} {cumulative}",
                    bucket_bound(i)
                );
            }
            let count = histogram.count.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{name}_bucket{{operation=\"{op}\",instance=\"{instance}\",le=\"+Inf\"}} {count}"
            );
            let _ = writeln!(
                out,
                "{name}_sum{{operation=\"{op}\",instance=\"{instance}\"}} {}",
                histogram.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9
            );
            let _ = writeln!(
                out,
                "{name}_count{{operation=\"{op}\",instance=\"{instance}\"}} {count}"
            );
        }

        out
    }
}

/// Starts the scrape endpoint and returns the bound address.
///
/// Serves `GET /metrics` (text exposition) and `GET /healthz`; every other
/// request gets a 404. The listener runs until the process exits.
pub async fn serve_metrics(addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "metrics endpoint listening");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    tokio::spawn(async move {
                        if let Err(err) = handle_scrape(socket).await {
                            error!(%err, "metrics scrape failed");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "metrics accept failed");
                    break;
                }
            }
        }
    });
    Ok(local)
}

async fn handle_scrape(mut socket: TcpStream) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = socket.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");

    let (status, body) = match path {
        "/metrics" | "/" => ("200 OK", Metrics::global().render()),
        "/healthz" => ("200 OK", "ok\n".to_string()),
        _ => ("404 Not Found", "not found\n".to_string()),
    };
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    socket.write_all(header.as_bytes()).await?;
    socket.write_all(body.as_bytes()).await?;
    let _ = socket.shutdown().await;
    Ok(())
}
