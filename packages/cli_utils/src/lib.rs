#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Logger and progress bar setup shared by the crime stream binaries.
//!
//! [`init_logger`] installs `pretty_env_logger` behind
//! `indicatif-log-bridge`, so log lines printed while the publisher's
//! progress bar is drawing do not tear the bar.

use std::sync::Arc;
use std::time::Duration;

use crime_stream_channel_models::MessagePosition;
use crime_stream_producer::PublishReport;
use crime_stream_producer::progress::PublishProgress;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// An `indicatif` bar driven through [`PublishProgress`].
pub struct IndicatifProgress {
    bar: ProgressBar,
    bar_style: ProgressStyle,
}

impl IndicatifProgress {
    /// A bar for publishing records. It spins until
    /// [`PublishProgress::started`] reports how many records are coming.
    #[must_use]
    pub fn publish_bar(multi: &MultiProgress, message: &str) -> Arc<dyn PublishProgress> {
        let bar = multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());

        let bar_style = ProgressStyle::with_template(
            "  {prefix} {wide_bar:.cyan/dim} {pos}/{len} {per_sec} [{eta}] {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Arc::new(Self { bar, bar_style })
    }
}

impl PublishProgress for IndicatifProgress {
    fn started(&self, topic: &str, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_style(self.bar_style.clone());
        self.bar.set_prefix(topic.to_string());
        self.bar.set_message(String::new());
    }

    fn published(&self, position: MessagePosition) {
        self.bar.inc(1);
        self.bar.set_message(format!("at {position}"));
    }

    fn finished(&self, report: &PublishReport) {
        let message = match (report.first, report.last) {
            (Some(first), Some(last)) => {
                format!("{} records ({first} to {last})", report.published)
            }
            _ => "no records".to_string(),
        };
        self.bar.finish_with_message(message);
    }

    fn interrupted(&self) {
        self.bar.abandon_with_message("interrupted");
    }
}

/// Installs the global logger and returns the [`MultiProgress`] every
/// progress bar must be added to.
///
/// The filter comes from `RUST_LOG`, falling back to
/// [`DEFAULT_LOG_FILTER`].
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filter) => builder.parse_filters(&filter),
        Err(_) => builder.parse_filters(DEFAULT_LOG_FILTER),
    };
    let logger = builder.build();
    let level = logger.filter();

    // Already installed when called twice in one process.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
