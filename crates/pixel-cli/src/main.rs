//! # pixel
//!
//! Command-line driver for the pixel client. Each invocation is one "page
//! load": it bootstraps a tracker at `--url` (which queues the initial page
//! view), runs the requested verb and drains the queue before exiting.
//!
//! Durable and session state live next to each other under `~/.pixel`, so
//! consecutive invocations behave like navigations within one browser.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pixel_client::{
    BestEffortStorage, DeviceContext, FileStorage, IdentityManager, ReqwestTransport,
    StaticEnvironment, StorageScope, TrackOptions, Tracker, TrackerParts,
};
use pixel_core::IdentityTraits;
use pixel_logging::LoggingConfig;
use pixel_settings::PixelSettings;
use serde_json::{Map, Value};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Emit tracking events against a collection endpoint.
#[derive(Parser, Debug)]
#[command(name = "pixel", about = "Pixel tracking client")]
struct Cli {
    /// Settings file (defaults to `~/.pixel/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// API base URL (overrides settings).
    #[arg(long)]
    api_base: Option<String>,

    /// Script-tag attribute, e.g. `data-session-timeout=15`. Repeatable.
    #[arg(long = "attr", value_name = "KEY=VALUE")]
    attributes: Vec<String>,

    /// URL of the simulated page.
    #[arg(long, default_value = "http://localhost/")]
    url: String,

    /// Document title.
    #[arg(long)]
    title: Option<String>,

    /// Document referrer.
    #[arg(long)]
    referrer: Option<String>,

    /// User agent reported in the device snapshot.
    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// Product context published by the page, as a JSON object.
    #[arg(long)]
    product: Option<String>,

    /// Seconds to wait for the queue to drain before giving up.
    #[arg(long, default_value = "10")]
    drain_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Record an arbitrary event.
    Track {
        /// Event name.
        name: String,
        /// Properties as a JSON object.
        #[arg(long)]
        props: Option<String>,
        /// Monetary value.
        #[arg(long)]
        value: Option<f64>,
        /// Currency for `--value`.
        #[arg(long)]
        currency: Option<String>,
        /// Count the event as a conversion.
        #[arg(long)]
        conversion: bool,
    },
    /// Record an additional page view.
    Page {
        /// Properties as a JSON object.
        #[arg(long)]
        props: Option<String>,
    },
    /// Attach identity traits to the visitor.
    Identify {
        /// Email address.
        #[arg(long)]
        email: Option<String>,
        /// Phone number.
        #[arg(long)]
        phone: Option<String>,
        /// Given name.
        #[arg(long)]
        first_name: Option<String>,
        /// Family name.
        #[arg(long)]
        last_name: Option<String>,
        /// Extra traits as a JSON object.
        #[arg(long)]
        traits: Option<String>,
    },
    /// Record a checkout step.
    Checkout {
        /// Stage label, e.g. `begin_checkout` or `purchase`.
        stage: String,
        /// Properties as a JSON object.
        #[arg(long)]
        props: Option<String>,
    },
    /// Print visitor, session, attribution and identity without sending anything.
    State,
}

/// Parse an optional JSON object argument.
fn parse_object(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw).with_context(|| format!("Invalid JSON: {raw}"))? {
        Value::Object(map) => Ok(map),
        other => bail!("Expected a JSON object, got {other}"),
    }
}

/// Parse `KEY=VALUE` pairs.
fn parse_attributes(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("Expected KEY=VALUE, got {pair}"))
        })
        .collect()
}

fn resolve_settings(args: &Cli) -> Result<PixelSettings> {
    let path = args.config.clone().unwrap_or_else(pixel_settings::settings_path);
    let mut settings = pixel_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(api_base) = &args.api_base {
        settings.api_base.clone_from(api_base);
    }
    pixel_settings::apply_script_attributes(&mut settings, &parse_attributes(&args.attributes)?);
    Ok(settings)
}

/// Session storage sits beside the durable file.
fn session_path(durable: &Path) -> PathBuf {
    durable.with_file_name("session.json")
}

/// `en_US.UTF-8` -> `en-US`.
fn language_from_locale(locale: &str) -> Option<String> {
    let tag = locale.split(['.', '@']).next()?.replace('_', "-");
    (!tag.is_empty() && tag != "C" && tag != "POSIX").then_some(tag)
}

fn environment(args: &Cli) -> Result<StaticEnvironment> {
    let device = DeviceContext {
        user_agent: args.user_agent.clone(),
        language: std::env::var("LANG").ok().as_deref().and_then(language_from_locale),
        timezone: std::env::var("TZ").ok(),
        ..DeviceContext::default()
    };
    let mut env = StaticEnvironment::new(args.url.clone(), device);
    if let Some(title) = &args.title {
        env = env.with_title(title.clone());
    }
    if let Some(referrer) = &args.referrer {
        env = env.with_referrer(referrer.clone());
    }
    if args.product.is_some() {
        env = env.with_product_context(parse_object(args.product.as_deref())?);
    }
    Ok(env)
}

fn run_command(tracker: &Tracker, command: Command) -> Result<()> {
    match command {
        Command::Track {
            name,
            props,
            value,
            currency,
            conversion,
        } => {
            let options = TrackOptions {
                value,
                currency,
                is_conversion: conversion,
                ..TrackOptions::default()
            };
            tracker
                .track(&name, parse_object(props.as_deref())?, options)
                .context("Track call rejected")?;
        }
        Command::Page { props } => {
            let event_id = tracker.page(parse_object(props.as_deref())?);
            tracing::debug!(%event_id, "page view queued");
        }
        Command::Identify {
            email,
            phone,
            first_name,
            last_name,
            traits,
        } => {
            let traits = traits
                .as_deref()
                .map(|raw| parse_object(Some(raw)))
                .transpose()?;
            tracker.identify(IdentityTraits {
                email,
                phone,
                first_name,
                last_name,
                traits,
            });
        }
        Command::Checkout { stage, props } => {
            tracker
                .track_checkout_event(&stage, parse_object(props.as_deref())?)
                .context("Checkout call rejected")?;
        }
        Command::State => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = resolve_settings(&args)?;
    let _ = pixel_logging::init_logging(&LoggingConfig::from(&settings.logging));

    let durable_path = settings.storage.durable_path();
    let durable = Arc::new(FileStorage::open(&durable_path));
    let session = Arc::new(FileStorage::open(session_path(&durable_path)));

    if args.command == Command::State {
        let identity = IdentityManager::load(
            BestEffortStorage::new(durable, StorageScope::Durable),
            BestEffortStorage::new(session, StorageScope::Session),
            settings.session.timeout(),
        );
        println!("{}", serde_json::to_string_pretty(&identity.snapshot())?);
        return Ok(());
    }

    let timeout = settings.delivery.request_timeout_ms.map(Duration::from_millis);
    let parts = TrackerParts {
        environment: Arc::new(environment(&args)?),
        durable,
        session,
        transport: Arc::new(ReqwestTransport::new(timeout)),
    };
    let tracker = Tracker::bootstrap(&settings, parts);

    run_command(&tracker, args.command)?;

    let drain_timeout = Duration::from_secs(args.drain_timeout_secs);
    if tokio::time::timeout(drain_timeout, tracker.drain()).await.is_err() {
        tracing::warn!(
            pending = tracker.queue().len(),
            timeout_secs = args.drain_timeout_secs,
            "drain timed out, undelivered events dropped"
        );
    }

    let stats = tracker.stats();
    tracing::info!(
        delivered = stats.delivered,
        rejected = stats.rejected,
        requeued = stats.requeued,
        dropped = stats.dropped,
        "done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_client::Environment;
    use serde_json::json;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["pixel", "page"]);
        assert_eq!(cli.url, "http://localhost/");
        assert_eq!(cli.drain_timeout_secs, 10);
        assert!(cli.attributes.is_empty());
        assert_eq!(cli.command, Command::Page { props: None });
    }

    #[test]
    fn cli_track_with_options() {
        let cli = Cli::parse_from([
            "pixel",
            "--url",
            "https://shop.test/?utm_source=cli",
            "track",
            "AddToCart",
            "--value",
            "9.5",
            "--currency",
            "USD",
            "--conversion",
        ]);
        assert_eq!(cli.url, "https://shop.test/?utm_source=cli");
        assert_eq!(
            cli.command,
            Command::Track {
                name: "AddToCart".into(),
                props: None,
                value: Some(9.5),
                currency: Some("USD".into()),
                conversion: true,
            }
        );
    }

    #[test]
    fn cli_repeated_attributes() {
        let cli = Cli::parse_from([
            "pixel",
            "--attr",
            "data-api-base=https://a.test",
            "--attr",
            "data-session-timeout=5",
            "state",
        ]);
        let attrs = parse_attributes(&cli.attributes).unwrap();
        assert_eq!(attrs["data-api-base"], "https://a.test");
        assert_eq!(attrs["data-session-timeout"], "5");
    }

    #[test]
    fn attribute_without_equals_is_an_error() {
        assert!(parse_attributes(&["data-endpoint".to_string()]).is_err());
    }

    #[test]
    fn parse_object_accepts_objects_only() {
        assert_eq!(parse_object(None).unwrap(), Map::new());
        let map = parse_object(Some(r#"{"sku":"A1","price":3}"#)).unwrap();
        assert_eq!(Value::Object(map), json!({"sku": "A1", "price": 3}));
        assert!(parse_object(Some("[1,2]")).is_err());
        assert!(parse_object(Some("{oops")).is_err());
    }

    #[test]
    fn settings_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"apiBase": "https://file.test", "session": {"timeoutMinutes": 45}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "pixel",
            "--config",
            path.to_str().unwrap(),
            "--attr",
            "data-session-timeout=5",
            "state",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.session.timeout_minutes, 5);

        let cli = Cli::parse_from([
            "pixel",
            "--config",
            path.to_str().unwrap(),
            "--api-base",
            "https://flag.test",
            "state",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.collect_url(), "https://flag.test/api/pixel/collect");
        assert_eq!(settings.session.timeout_minutes, 45);
    }

    #[test]
    fn session_file_sits_beside_durable_file() {
        let path = session_path(Path::new("/home/u/.pixel/storage.json"));
        assert_eq!(path, PathBuf::from("/home/u/.pixel/session.json"));
    }

    #[test]
    fn locale_to_language_tag() {
        assert_eq!(language_from_locale("en_US.UTF-8").as_deref(), Some("en-US"));
        assert_eq!(language_from_locale("de_DE@euro").as_deref(), Some("de-DE"));
        assert_eq!(language_from_locale("C"), None);
    }

    #[test]
    fn environment_carries_product_context() {
        let cli = Cli::parse_from([
            "pixel",
            "--url",
            "https://shop.test/p/1",
            "--title",
            "Boots",
            "--product",
            r#"{"price": 80}"#,
            "page",
        ]);
        let env = environment(&cli).unwrap();
        assert_eq!(env.page().title.as_deref(), Some("Boots"));
        assert_eq!(env.product_context().unwrap()["price"], json!(80));
    }
}
