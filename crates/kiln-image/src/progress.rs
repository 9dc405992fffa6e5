//! Progress estimation for `docker pull` output.
//!
//! The engine prints one status line per layer event. [`PullProgress`]
//! turns that stream into a single percentage that only ever goes up,
//! stays below 100 while the pull is running, and reaches exactly 100 once
//! the pull succeeds.
//!
//! Per-layer values follow the pull's own phases:
//!
//! ```text
//! Waiting 0 -> Downloading 0..=89 -> Verifying Checksum 90
//!   -> Download complete 95 -> Extracting 80..=99 -> Pull complete 100
//! ```

use std::collections::BTreeMap;

/// Highest per-layer value a download can reach before verification.
pub const DOWNLOAD_CEILING: f64 = 89.0;

/// Value for a downloading layer whose progress could not be parsed.
pub const DOWNLOAD_DEFAULT: f64 = 10.0;

/// Value for an extracting layer whose progress bar could not be parsed.
pub const EXTRACT_DEFAULT: f64 = 85.0;

/// Highest overall value reported before the pull has exited.
pub const RUNNING_CEILING: f64 = 99.0;

/// One classified line of pull output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent<'a> {
    /// `<tag>: Pulling from <repo>`
    Started,
    /// `<id>: Pulling fs layer`
    NewLayer(&'a str),
    /// `<id>: Downloading <detail>`
    Downloading { layer: &'a str, detail: &'a str },
    /// `<id>: Waiting`
    Waiting(&'a str),
    /// `<id>: Verifying Checksum`
    Verifying(&'a str),
    /// `<id>: Download complete`
    Downloaded(&'a str),
    /// `<id>: Extracting <detail>`
    Extracting { layer: &'a str, detail: &'a str },
    /// `<id>: Pull complete`
    Complete(&'a str),
    /// Anything else (digests, status summaries).
    Other,
}

impl<'a> PullEvent<'a> {
    /// Classify a single output line.
    pub fn parse(line: &'a str) -> Self {
        if line.contains(": Pulling from ") {
            return PullEvent::Started;
        }

        let Some((layer, rest)) = line.split_once(": ") else {
            return PullEvent::Other;
        };
        let layer = layer.trim();
        let rest = rest.trim_end();

        if rest.starts_with("Pulling fs layer") {
            PullEvent::NewLayer(layer)
        } else if let Some(detail) = rest.strip_prefix("Downloading") {
            PullEvent::Downloading { layer, detail }
        } else if rest.starts_with("Waiting") {
            PullEvent::Waiting(layer)
        } else if rest.starts_with("Verifying Checksum") {
            PullEvent::Verifying(layer)
        } else if rest.starts_with("Download complete") {
            PullEvent::Downloaded(layer)
        } else if let Some(detail) = rest.strip_prefix("Extracting") {
            PullEvent::Extracting { layer, detail }
        } else if rest.starts_with("Pull complete") {
            PullEvent::Complete(layer)
        } else {
            PullEvent::Other
        }
    }
}

/// Fill ratio of an ASCII progress bar such as `[=====>    ]`.
///
/// The head marker takes one cell, so a bar of `n` cells is full at `n - 1`
/// equals signs. Returns `None` when there is no usable bar.
pub fn bar_ratio(text: &str) -> Option<f64> {
    let start = text.find('[')?;
    let end = start + text[start..].find(']')?;
    let bar = &text[start + 1..end];
    let cells = bar.chars().count();
    if cells < 2 {
        return None;
    }
    let filled = bar.chars().filter(|&c| c == '=').count();
    Some(filled as f64 / (cells - 1) as f64)
}

/// Parse an engine size string like `512B`, `1.5kB`, `30MB` or `1.2GB` into bytes.
pub fn parse_engine_size(text: &str) -> Option<f64> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();
    let (number, multiplier) = if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024.0)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024.0 * 1024.0)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024.0 * 1024.0 * 1024.0)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1.0)
    } else {
        (upper.as_str(), 1.0)
    };
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v * multiplier)
}

/// Ratio from a `current/total` size pair, looked for after any progress bar.
fn size_ratio(detail: &str) -> Option<f64> {
    let sizes = match detail.rfind(']') {
        Some(end) => &detail[end + 1..],
        None => detail,
    };
    let (current, total) = sizes.trim().split_once('/')?;
    let current = parse_engine_size(current)?;
    let total = parse_engine_size(total)?;
    (total > 0.0).then(|| current / total)
}

/// Streaming estimator for one pull.
#[derive(Debug, Clone, Default)]
pub struct PullProgress {
    layers: BTreeMap<String, f64>,
    total_layers: usize,
    completed_layers: usize,
    downloading: bool,
    last_reported: Option<u8>,
    finished: bool,
}

impl PullProgress {
    /// A fresh estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value handed to the caller.
    pub fn last_reported(&self) -> Option<u8> {
        self.last_reported
    }

    /// Number of layers announced so far.
    pub fn total_layers(&self) -> usize {
        self.total_layers
    }

    /// Current per-layer value, if the layer is tracked.
    pub fn layer(&self, id: &str) -> Option<f64> {
        self.layers.get(id).copied()
    }

    /// Feed one output line; returns the values to report, in order.
    pub fn observe(&mut self, line: &str) -> Vec<u8> {
        let mut out = Vec::new();
        if self.finished || line.trim().is_empty() {
            return out;
        }

        match PullEvent::parse(line) {
            PullEvent::Started => self.report(1, &mut out),
            PullEvent::NewLayer(_) => {
                self.total_layers += 1;
                if self.total_layers == 1 {
                    self.report(2, &mut out);
                }
            }
            PullEvent::Downloading { layer, detail } => {
                self.downloading = true;
                let ratio = bar_ratio(detail).or_else(|| size_ratio(detail));
                match ratio {
                    Some(ratio) => {
                        let value = (ratio * 100.0).clamp(0.0, DOWNLOAD_CEILING);
                        self.layers.insert(layer.to_string(), value);
                    }
                    None => {
                        self.layers
                            .entry(layer.to_string())
                            .or_insert(DOWNLOAD_DEFAULT);
                    }
                }
            }
            PullEvent::Waiting(layer) => {
                self.layers.entry(layer.to_string()).or_insert(0.0);
            }
            PullEvent::Verifying(layer) => {
                self.layers.insert(layer.to_string(), 90.0);
            }
            PullEvent::Downloaded(layer) => {
                self.layers.insert(layer.to_string(), 95.0);
            }
            PullEvent::Extracting { layer, detail } => {
                let value = bar_ratio(detail)
                    .map(|ratio| 80.0 + ratio.clamp(0.0, 1.0) * 19.0)
                    .unwrap_or(EXTRACT_DEFAULT);
                self.layers.insert(layer.to_string(), value);
            }
            PullEvent::Complete(layer) => {
                self.layers.insert(layer.to_string(), 100.0);
                self.completed_layers += 1;
            }
            PullEvent::Other => {}
        }

        if let Some(overall) = self.overall() {
            self.report(overall as u8, &mut out);
        }
        out
    }

    /// Close the stream. A successful pull reports exactly one `100`.
    pub fn finish(&mut self, success: bool) -> Option<u8> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if success {
            self.last_reported = Some(100);
            Some(100)
        } else {
            None
        }
    }

    /// Overall estimate, or `None` before any layer is tracked.
    fn overall(&self) -> Option<f64> {
        if self.layers.is_empty() {
            return None;
        }

        let tracked = self.layers.len() as f64;
        let total = self.total_layers as f64;

        let overall = if self.total_layers > 0 && !self.downloading {
            (tracked / total * 10.0).min(10.0)
        } else {
            let average = self.layers.values().sum::<f64>() / tracked;
            let mut overall = if self.total_layers > 0 {
                average * (tracked / total)
            } else {
                average
            };
            if self.completed_layers > 0 && self.total_layers > 0 {
                let completed = self.completed_layers as f64 / total * 100.0;
                overall = completed * 0.7 + overall * 0.3;
            }
            overall
        };

        Some(overall.clamp(0.0, RUNNING_CEILING))
    }

    /// Queue `value` if it strictly exceeds everything reported so far.
    fn report(&mut self, value: u8, out: &mut Vec<u8>) {
        if self.last_reported.map_or(true, |last| value > last) {
            self.last_reported = Some(value);
            out.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(progress: &mut PullProgress, lines: &[&str]) -> Vec<u8> {
        lines.iter().flat_map(|l| progress.observe(l)).collect()
    }

    #[test]
    fn test_parse_events() {
        assert_eq!(
            PullEvent::parse("latest: Pulling from library/alpine"),
            PullEvent::Started
        );
        assert_eq!(
            PullEvent::parse("a1b2: Pulling fs layer"),
            PullEvent::NewLayer("a1b2")
        );
        assert_eq!(PullEvent::parse("a1b2: Waiting"), PullEvent::Waiting("a1b2"));
        assert_eq!(
            PullEvent::parse("a1b2: Verifying Checksum"),
            PullEvent::Verifying("a1b2")
        );
        assert_eq!(
            PullEvent::parse("a1b2: Download complete"),
            PullEvent::Downloaded("a1b2")
        );
        assert_eq!(
            PullEvent::parse("a1b2: Pull complete"),
            PullEvent::Complete("a1b2")
        );
        assert_eq!(
            PullEvent::parse("a1b2: Downloading [==>  ]  1MB/4MB"),
            PullEvent::Downloading {
                layer: "a1b2",
                detail: " [==>  ]  1MB/4MB"
            }
        );
        assert_eq!(
            PullEvent::parse("Digest: sha256:0123abcd"),
            PullEvent::Other
        );
        assert_eq!(
            PullEvent::parse("Status: Downloaded newer image for alpine:latest"),
            PullEvent::Other
        );
        assert_eq!(PullEvent::parse("docker.io/library/alpine:latest"), PullEvent::Other);
    }

    #[test]
    fn test_bar_ratio() {
        assert_eq!(bar_ratio("[==>  ]"), Some(0.5));
        assert_eq!(bar_ratio(" [=====>] 5MB/5MB"), Some(1.0));
        assert_eq!(bar_ratio("[>    ]"), Some(0.0));
        assert_eq!(bar_ratio("no bar"), None);
        assert_eq!(bar_ratio("[]"), None);
        assert_eq!(bar_ratio("[>]"), None);
        assert_eq!(bar_ratio("] backwards ["), None);
    }

    #[test]
    fn test_parse_engine_size() {
        assert_eq!(parse_engine_size("512B"), Some(512.0));
        assert_eq!(parse_engine_size("2KB"), Some(2048.0));
        assert_eq!(parse_engine_size("1.5kB"), Some(1536.0));
        assert_eq!(parse_engine_size(" 30MB "), Some(30.0 * 1024.0 * 1024.0));
        assert_eq!(parse_engine_size("1GB"), Some(1024.0 * 1024.0 * 1024.0));
        assert_eq!(parse_engine_size("42"), Some(42.0));
        assert_eq!(parse_engine_size("lots"), None);
    }

    #[test]
    fn test_start_and_first_layer_emit_fixed_values() {
        let mut p = PullProgress::new();
        assert_eq!(p.observe("latest: Pulling from library/alpine"), vec![1]);
        assert_eq!(p.observe("aaa: Pulling fs layer"), vec![2]);
        assert!(p.observe("bbb: Pulling fs layer").is_empty());
        assert_eq!(p.total_layers(), 2);
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        let mut p = PullProgress::new();
        assert!(p.observe("").is_empty());
        assert!(p.observe("   ").is_empty());
        assert_eq!(p.last_reported(), None);
    }

    #[test]
    fn test_discovery_phase_caps_at_ten() {
        let mut p = PullProgress::new();
        feed(&mut p, &["aaa: Pulling fs layer", "bbb: Pulling fs layer"]);
        // One of two layers tracked before any download: 5.
        assert_eq!(p.observe("aaa: Waiting"), vec![5]);
        assert_eq!(p.observe("bbb: Waiting"), vec![10]);
    }

    #[test]
    fn test_downloading_bar_is_capped() {
        let mut p = PullProgress::new();
        p.observe("aaa: Pulling fs layer");
        p.observe("aaa: Downloading [=====>] 5MB/5MB");
        assert_eq!(p.layer("aaa"), Some(DOWNLOAD_CEILING));
    }

    #[test]
    fn test_downloading_size_fallback_and_default() {
        let mut p = PullProgress::new();
        p.observe("aaa: Downloading 1MB/4MB");
        assert_eq!(p.layer("aaa"), Some(25.0));

        p.observe("bbb: Downloading");
        assert_eq!(p.layer("bbb"), Some(DOWNLOAD_DEFAULT));

        // The default never overwrites a parsed value.
        p.observe("aaa: Downloading");
        assert_eq!(p.layer("aaa"), Some(25.0));
    }

    #[test]
    fn test_waiting_does_not_reset_a_tracked_layer() {
        let mut p = PullProgress::new();
        p.observe("aaa: Downloading [==>  ]");
        p.observe("aaa: Waiting");
        assert_eq!(p.layer("aaa"), Some(50.0));
    }

    #[test]
    fn test_fixed_phase_values() {
        let mut p = PullProgress::new();
        p.observe("aaa: Verifying Checksum");
        assert_eq!(p.layer("aaa"), Some(90.0));
        p.observe("aaa: Download complete");
        assert_eq!(p.layer("aaa"), Some(95.0));
        p.observe("aaa: Extracting");
        assert_eq!(p.layer("aaa"), Some(EXTRACT_DEFAULT));
        p.observe("aaa: Extracting [=====>] 3MB/3MB");
        assert_eq!(p.layer("aaa"), Some(99.0));
        p.observe("aaa: Pull complete");
        assert_eq!(p.layer("aaa"), Some(100.0));
    }

    #[test]
    fn test_completed_layers_dominate() {
        let mut p = PullProgress::new();
        feed(
            &mut p,
            &[
                "aaa: Pulling fs layer",
                "bbb: Pulling fs layer",
                "aaa: Downloading [>    ]",
                "bbb: Downloading [>    ]",
            ],
        );
        // 0.7 * 50 + 0.3 * (50 * 2/2) = 50.
        assert_eq!(p.observe("aaa: Pull complete"), vec![50]);
    }

    #[test]
    fn test_stays_below_100_until_finish() {
        let mut p = PullProgress::new();
        let values = feed(
            &mut p,
            &[
                "latest: Pulling from library/alpine",
                "aaa: Pulling fs layer",
                "aaa: Downloading [=====>] 3MB/3MB",
                "aaa: Verifying Checksum",
                "aaa: Download complete",
                "aaa: Extracting [=====>] 3MB/3MB",
                "aaa: Pull complete",
                "Digest: sha256:feed",
                "Status: Downloaded newer image for alpine:latest",
            ],
        );
        assert!(values.iter().all(|&v| v <= 99));
        assert_eq!(values.last(), Some(&99));
        assert_eq!(p.finish(true), Some(100));
        assert_eq!(p.finish(true), None);
        assert!(p.observe("aaa: Pull complete").is_empty());
    }

    #[test]
    fn test_failure_reports_nothing_more() {
        let mut p = PullProgress::new();
        p.observe("latest: Pulling from library/alpine");
        assert_eq!(p.finish(false), None);
        assert_eq!(p.last_reported(), Some(1));
    }

    #[test]
    fn test_reports_are_strictly_increasing() {
        let mut p = PullProgress::new();
        let lines = [
            "latest: Pulling from library/ubuntu",
            "aaa: Pulling fs layer",
            "bbb: Pulling fs layer",
            "ccc: Pulling fs layer",
            "bbb: Waiting",
            "ccc: Waiting",
            "aaa: Downloading [=>        ]  1MB/10MB",
            "aaa: Downloading [=====>    ]  5MB/10MB",
            "aaa: Downloading [=>        ]  1MB/10MB",
            "bbb: Downloading [==>       ]  2MB/10MB",
            "aaa: Verifying Checksum",
            "aaa: Download complete",
            "aaa: Extracting [=>        ]",
            "ccc: Downloading [=========>]",
            "aaa: Pull complete",
            "bbb: Verifying Checksum",
            "bbb: Download complete",
            "bbb: Extracting [=====>    ]",
            "bbb: Pull complete",
            "ccc: Download complete",
            "ccc: Pull complete",
        ];
        let values = feed(&mut p, &lines);
        assert!(values.windows(2).all(|w| w[0] < w[1]), "{values:?}");
        assert!(values.iter().all(|&v| v <= 99));
        assert_eq!(values[..2], [1, 2]);
    }
}
