//! Log and tick-span output for avatar sessions.
//!
//! [`init_tracing`] installs the global subscriber. Every
//! [`LocalAvatar::update`](crate::avatar::LocalAvatar::update) runs inside an
//! `avatar_tick` span carrying the frame number and avatar id, so follow,
//! controller and safe-landing events of one tick group together in the log
//! and, when a collector is configured, in the exported trace.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `info`; `avatar_recenter=debug` shows follow decisions). |
//! | `AVATAR_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact lines. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL; tick spans are exported when set. |
//!
//! ```rust,no_run
//! let _telemetry = avatar_runtime::telemetry::init_tracing("avatar-sim");
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Instrumentation scope of exported tick spans.
const TRACER_NAME: &str = "avatar-runtime";

/// Console output style, chosen by `AVATAR_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("AVATAR_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Install the global subscriber for an avatar session named `service_name`.
///
/// Keep the returned guard alive until the session ends; dropping it flushes
/// tick spans still queued for the collector.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env();
    let provider = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|endpoint| tick_span_exporter(service_name, endpoint));

    let tick_spans = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(TRACER_NAME)));
    tracing_subscriber::registry()
        .with(filter)
        .with(tick_spans)
        .with((format == LogFormat::Json).then(|| fmt::layer().json()))
        .with((format == LogFormat::Compact).then(|| fmt::layer().compact()))
        .init();

    TracerProviderGuard(provider)
}

/// Flushes and shuts down the span exporter on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// `true` when tick spans go to a collector.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[avatar] tick span exporter shutdown failed: {e}");
        }
    }
}

/// OTLP/HTTP provider for `endpoint`, or `None` when the exporter cannot be
/// built. Errors go to stderr since no subscriber exists yet.
fn tick_span_exporter(service_name: &str, endpoint: String) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[avatar] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attribute(KeyValue::new("avatar.runtime.version", env!("CARGO_PKG_VERSION")))
        .build();

    // The tick loop is synchronous, so spans are exported inline rather
    // than through a batch worker that needs a Tokio runtime.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
