//! Destinations for emitted metrics and artefacts.
//!
//! The trainer only names what it emits; where it ends up is up to the sink.
//! Reducing values across parallel workers is the sink's (or its backend's)
//! business, not the trainer's.

use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub trait MetricSink: Send {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize) -> Result<()>;

    /// An SVG image.
    fn log_image(&mut self, name: &str, svg: &str) -> Result<()>;

    /// A table; each row is a JSON array in `columns` order.
    fn log_table(&mut self, name: &str, columns: &[&str], rows: &[serde_json::Value]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ScalarLine<'a> {
    name: &'a str,
    value: f32,
    step: usize,
    time: String,
}

/// Writes scalars to `<dir>/metrics.jsonl`, images to `<dir>/<name>.svg`
/// and tables to `<dir>/<name>.json`.
pub struct JsonlSink {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artefact_path(&self, name: &str, extension: &str) -> PathBuf {
        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{stem}.{extension}"))
    }
}

impl MetricSink for JsonlSink {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize) -> Result<()> {
        let line = ScalarLine {
            name,
            value,
            step,
            time: base::format_timestamp(),
        };
        serde_json::to_writer(&mut self.scalars, &line)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }

    fn log_image(&mut self, name: &str, svg: &str) -> Result<()> {
        let path = self.artefact_path(name, "svg");
        std::fs::write(&path, svg)?;
        log::info!("wrote image '{}' to {}", name, path.display());
        Ok(())
    }

    fn log_table(&mut self, name: &str, columns: &[&str], rows: &[serde_json::Value]) -> Result<()> {
        let path = self.artefact_path(name, "json");
        let table = serde_json::json!({ "columns": columns, "data": rows });
        std::fs::write(&path, serde_json::to_vec_pretty(&table)?)?;
        log::info!("wrote table '{}' ({} rows) to {}", name, rows.len(), path.display());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub scalars: Vec<(String, f32, usize)>,
    pub images: Vec<(String, String)>,
    pub tables: Vec<(String, Vec<String>, Vec<serde_json::Value>)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every value logged under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<f32> {
        self.scalars
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| *v)
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<f32> {
        self.values(name).last().copied()
    }
}

impl MetricSink for MemorySink {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize) -> Result<()> {
        self.scalars.push((name.to_string(), value, step));
        Ok(())
    }

    fn log_image(&mut self, name: &str, svg: &str) -> Result<()> {
        self.images.push((name.to_string(), svg.to_string()));
        Ok(())
    }

    fn log_table(&mut self, name: &str, columns: &[&str], rows: &[serde_json::Value]) -> Result<()> {
        self.tables.push((
            name.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
            rows.to_vec(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("tagging-sink-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut sink = JsonlSink::new(&dir).unwrap();
        sink.log_scalar("val_loss", 0.25, 3).unwrap();
        sink.log_scalar("val_auroc", 0.75, 3).unwrap();
        sink.log_image("confusion_matrix", "<svg></svg>").unwrap();
        sink.log_table("Confusion Matrix", &["target", "prediction", "value"], &[serde_json::json!(["a", "b", 0.5])])
            .unwrap();
        sink.flush().unwrap();

        let text = std::fs::read_to_string(dir.join("metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "val_loss");
        assert_eq!(lines[1]["step"], 3);

        assert!(dir.join("confusion_matrix.svg").exists());
        let table: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("Confusion_Matrix.json")).unwrap()).unwrap();
        assert_eq!(table["columns"][1], "prediction");
        assert_eq!(table["data"][0][2], 0.5);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_sink_lookup() {
        let mut sink = MemorySink::new();
        sink.log_scalar("train_loss_step", 1.0, 0).unwrap();
        sink.log_scalar("train_loss_step", 0.5, 1).unwrap();
        assert_eq!(sink.values("train_loss_step"), vec![1.0, 0.5]);
        assert_eq!(sink.last("train_loss_step"), Some(0.5));
        assert_eq!(sink.last("val_loss"), None);
    }
}
