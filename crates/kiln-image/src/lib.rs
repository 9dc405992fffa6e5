//! # kiln-image
//!
//! Container engine client for Kiln.
//!
//! The engine owns all image and container state, so nothing here is
//! persisted: listings are parsed from the engine's formatted output on
//! every call. The one piece with real logic is [`PullProgress`], which
//! turns the line-oriented output of `docker pull` into a monotonic
//! percentage.
//!
//! ```ignore
//! use kiln_image::ContainerEngine;
//!
//! # async fn example() -> kiln_image::Result<()> {
//! let engine = ContainerEngine::new("docker");
//! engine.check_installed().await?;
//! engine.pull("alpine:latest", |pct| eprintln!("{pct}%")).await?;
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod models;
mod progress;

pub use engine::ContainerEngine;
pub use error::{ImageError, Result};
pub use models::{
    filter_images, parse_containers, parse_hub_results, parse_images, ContainerSummary,
    HubResult, ImageSummary, CONTAINERS_FORMAT, IMAGES_FORMAT,
};
pub use progress::{
    bar_ratio, parse_engine_size, PullEvent, PullProgress, DOWNLOAD_CEILING, DOWNLOAD_DEFAULT,
    EXTRACT_DEFAULT, RUNNING_CEILING,
};
