//! Источник наблюдаемых подключений: username -> набор активных IP.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

pub type Observations = HashMap<String, BTreeSet<String>>;

#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn observe(&self) -> Result<Observations, anyhow::Error>;
}

/// JSON-снимок, который пишет внешний сборщик: `{"user": ["1.2.3.4", ...]}`.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

pub fn parse_observations(raw: &str) -> Result<Observations, anyhow::Error> {
    let parsed: HashMap<String, Vec<String>> = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("Некорректный снимок подключений: {}", e))?;
    Ok(parsed
        .into_iter()
        .map(|(username, ips)| {
            let ips = ips
                .into_iter()
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
                .collect();
            (username, ips)
        })
        .collect())
}

#[async_trait]
impl ConnectionSource for JsonFileSource {
    async fn observe(&self) -> Result<Observations, anyhow::Error> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Connections snapshot not found yet");
                return Ok(Observations::new());
            }
            Err(error) => {
                return Err(anyhow::anyhow!(
                    "Не удалось прочитать {}: {}",
                    self.path.display(),
                    error
                ));
            }
        };
        parse_observations(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_deduplicates_ips() {
        let observations =
            parse_observations(r#"{"alice": ["1.1.1.1", " 1.1.1.1 ", "2.2.2.2", ""], "bob": []}"#)
                .unwrap();
        assert_eq!(observations["alice"].len(), 2);
        assert!(observations["bob"].is_empty());
    }

    #[test]
    fn rejects_non_object() {
        assert!(parse_observations("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn missing_file_is_empty_observation() {
        let source = JsonFileSource::new("/nonexistent/limiter-admin/connections.json");
        assert!(source.observe().await.unwrap().is_empty());
    }
}
