use crate::domain::model::Car;
use crate::utils::error::{FerryError, Result};
use chrono::Utc;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ManifestRow {
    link: String,
    size: u64,
    #[serde(rename = "commP", default)]
    comm_p: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    md5: String,
}

/// Reads the car manifest handed to the local CLI: CSV with a
/// `link,size,commP,url,md5` header, or one JSON object per line.
#[derive(Debug, Clone)]
pub struct ManifestReader {
    path: String,
}

impl ManifestReader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<Vec<Car>> {
        let content = fs::read_to_string(&self.path)?;
        let is_csv = Path::new(&self.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

        let rows = if is_csv {
            Self::parse_csv(&content)?
        } else {
            Self::parse_json_lines(&content)?
        };

        let now = Utc::now();
        let mut cars = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            if row.link.trim().is_empty() {
                return Err(FerryError::InvalidConfigValueError {
                    field: "manifest".to_string(),
                    value: self.path.clone(),
                    reason: format!("entry {} has an empty link", index + 1),
                });
            }
            cars.push(Car {
                link: row.link,
                size: row.size,
                comm_p: row.comm_p,
                url: row.url,
                md5: row.md5,
                inserted_at: now,
            });
        }

        tracing::info!("📄 Read {} cars from {}", cars.len(), self.path);
        Ok(cars)
    }

    fn parse_csv(content: &str) -> Result<Vec<ManifestRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    fn parse_json_lines(content: &str) -> Result<Vec<ManifestRow>> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(FerryError::from))
            .collect()
    }
}
