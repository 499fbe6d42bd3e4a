use facereg_core::detector::DEFAULT_CONFIDENCE_THRESHOLD;
use std::path::PathBuf;
use std::str::FromStr;

/// Similarity a match must exceed to count as recognized.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a match must exceed.
    pub similarity_threshold: f32,
    /// Minimum detector score for a face.
    pub detection_threshold: f32,
    /// Threads per ONNX session.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `FACEREG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facereg");

        Self {
            model_dir: var("FACEREG_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            db_path: var("FACEREG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("faces.db")),
            similarity_threshold: parse_var(&var, "FACEREG_SIMILARITY_THRESHOLD")
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            detection_threshold: parse_var(&var, "FACEREG_DETECTION_THRESHOLD")
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            intra_threads: parse_var(&var, "FACEREG_INTRA_THREADS").unwrap_or(2),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(facereg_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the FaceNet embedding model.
    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(facereg_core::EMBEDDING_MODEL_FILE)
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/ann")]);
        assert_eq!(cfg.db_path, PathBuf::from("/home/ann/.local/share/facereg/faces.db"));
        assert_eq!(cfg.model_dir, PathBuf::from("/home/ann/.local/share/facereg/models"));
        assert_eq!(cfg.similarity_threshold, 0.7);
        assert_eq!(cfg.detection_threshold, 0.5);
        assert_eq!(cfg.intra_threads, 2);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("XDG_DATA_HOME", "/data"),
            ("FACEREG_MODEL_DIR", "/opt/models"),
            ("FACEREG_SIMILARITY_THRESHOLD", "0.55"),
            ("FACEREG_INTRA_THREADS", "4"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/data/facereg/faces.db"));
        assert_eq!(
            cfg.embedding_model_path(),
            PathBuf::from("/opt/models/facenet_512.onnx")
        );
        assert_eq!(cfg.similarity_threshold, 0.55);
        assert_eq!(cfg.intra_threads, 4);
    }

    #[test]
    fn test_unparseable_value_falls_back() {
        let cfg = config(&[("HOME", "/h"), ("FACEREG_DETECTION_THRESHOLD", "high")]);
        assert_eq!(cfg.detection_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
    }
}
