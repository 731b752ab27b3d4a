//! Statsd reporting.
//!
//! Nothing is sent until [`configure_statsd`] installed a client. Until then
//! [`metric!`](crate::metric) is a no-op.
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Traits the [`metric!`](crate::metric) expansion calls on the statsd client.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client plus the tags attached to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    pub statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    /// Adds the default tags to `metric` and sends it.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Reports metrics to the statsd server at `host`, with every name prefixed by `prefix`.
///
/// Only the first call takes effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        default_tags,
    };
    match CLIENT.set(client) {
        Ok(()) => tracing::info!(addrs = ?addrs, prefix, "Reporting metrics to statsd"),
        Err(_) => tracing::warn!("statsd metrics were already configured"),
    }
    Ok(())
}

/// Calls `f` with the installed client, or returns the default if there is none.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("pool.hit") += 1, "exact" => "true");
/// metric!(gauge("disk.size.bytes") = total);
/// metric!(time_raw("download.size") = bytes);
/// ```
#[macro_export]
macro_rules! metric {
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd.$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};

    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };

    // sizes go out as timers, statsd keeps their distribution
    (time_raw($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
}
