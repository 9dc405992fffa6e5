//! Records parsed from container engine listings.

use serde::{Deserialize, Serialize};

/// Placeholder entries produced by repository scaffolding; never shown.
const PLACEHOLDER: &str = ".gitkeep";

/// Go template passed to `docker images --format`.
pub const IMAGES_FORMAT: &str = "{{.Repository}}:{{.Tag}}\t{{.ID}}\t{{.Size}}\t{{.CreatedAt}}";

/// Go template passed to `docker ps -a --format`.
pub const CONTAINERS_FORMAT: &str = "{{.ID}}\t{{.Image}}\t{{.Status}}\t{{.Names}}\t{{.Ports}}";

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    /// `repository:tag`
    pub name_tag: String,
    /// Short image id.
    pub id: String,
    /// Human-readable size as printed by the engine.
    pub size: String,
    /// Creation timestamp as printed by the engine.
    pub created_at: String,
}

/// A container in any state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Short container id.
    pub id: String,
    /// Image the container was created from.
    pub image: String,
    /// Status text, e.g. `Up 3 minutes`.
    pub status: String,
    /// Container name.
    pub name: String,
    /// Published ports, possibly empty.
    pub ports: String,
}

/// One result of a registry search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubResult {
    /// Repository name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Star count.
    pub stars: u64,
    /// Whether this is an official image.
    pub official: bool,
    /// Whether the image is built automatically.
    pub automated: bool,
}

/// Raw shape of one `docker search --format "{{json .}}"` line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHubResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    star_count: serde_json::Value,
    #[serde(default)]
    is_official: serde_json::Value,
    #[serde(default)]
    is_automated: serde_json::Value,
}

/// The engine prints flags as `"[OK]"`; anything else is false.
fn ok_flag(value: &serde_json::Value) -> bool {
    value.as_str() == Some("[OK]")
}

fn star_count(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Parse `docker images` output in [`IMAGES_FORMAT`].
pub fn parse_images(stdout: &str) -> Vec<ImageSummary> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 4 || parts[0].contains(PLACEHOLDER) {
                return None;
            }
            Some(ImageSummary {
                name_tag: parts[0].to_string(),
                id: parts[1].to_string(),
                size: parts[2].to_string(),
                created_at: parts[3].to_string(),
            })
        })
        .collect()
}

/// Parse `docker ps -a` output in [`CONTAINERS_FORMAT`].
pub fn parse_containers(stdout: &str) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 || parts[1].contains(PLACEHOLDER) {
                return None;
            }
            Some(ContainerSummary {
                id: parts[0].to_string(),
                image: parts[1].to_string(),
                status: parts[2].to_string(),
                name: parts[3].to_string(),
                ports: parts[4].to_string(),
            })
        })
        .collect()
}

/// Parse JSON-lines search output; malformed lines are logged and skipped.
pub fn parse_hub_results(stdout: &str) -> Vec<HubResult> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<RawHubResult>(line) {
            Ok(raw) => Some(HubResult {
                stars: star_count(&raw.star_count),
                official: ok_flag(&raw.is_official),
                automated: ok_flag(&raw.is_automated),
                name: raw.name,
                description: raw.description,
            }),
            Err(e) => {
                tracing::error!(error = %e, line = %line, "Failed to parse registry search result");
                None
            }
        })
        .collect()
}

/// Images whose `name:tag` contains `term`, ignoring case.
pub fn filter_images(images: Vec<ImageSummary>, term: &str) -> Vec<ImageSummary> {
    let term = term.to_lowercase();
    images
        .into_iter()
        .filter(|image| image.name_tag.to_lowercase().contains(&term))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_images_skips_placeholders_and_short_lines() {
        let out = "alpine:latest\tabc123\t7.8MB\t2024-01-01 10:00:00 +0000 UTC\n\
                   .gitkeep:latest\tdef\t0B\tnever\n\
                   broken line\n\
                   \n\
                   nginx:1.25\tfff\t180MB\t2024-02-02";
        let images = parse_images(out);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].name_tag, "alpine:latest");
        assert_eq!(images[0].size, "7.8MB");
        assert_eq!(images[1].id, "fff");
    }

    #[test]
    fn test_parse_containers() {
        let out = "c1\tnginx:1.25\tUp 3 minutes\tweb\t0.0.0.0:80->80/tcp\n\
                   c2\t.gitkeep\tExited (0)\tjunk\t\n\
                   c3\talpine\tExited (0) 2 days ago\tshell\t";
        let containers = parse_containers(out);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].ports, "0.0.0.0:80->80/tcp");
        assert_eq!(containers[1].id, "c3");
        assert_eq!(containers[1].ports, "");
    }

    #[test]
    fn test_parse_hub_results() {
        let out = r#"{"Name":"nginx","Description":"Official build","StarCount":"19000","IsOfficial":"[OK]","IsAutomated":""}
not json at all
{"Name":"bitnami/nginx","Description":"","StarCount":180,"IsOfficial":"","IsAutomated":"[OK]"}
{"Name":"odd","IsOfficial":true}"#;
        let results = parse_hub_results(out);
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].name, "nginx");
        assert_eq!(results[0].stars, 19000);
        assert!(results[0].official);
        assert!(!results[0].automated);

        assert_eq!(results[1].stars, 180);
        assert!(!results[1].official);
        assert!(results[1].automated);

        // Only the literal "[OK]" counts.
        assert!(!results[2].official);
        assert_eq!(results[2].stars, 0);
    }

    #[test]
    fn test_filter_images_is_case_insensitive() {
        let images = parse_images("Alpine:Latest\ta\t1MB\tx\nnginx:1\tb\t2MB\ty");
        let found = filter_images(images, "alp");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_tag, "Alpine:Latest");
    }
}
