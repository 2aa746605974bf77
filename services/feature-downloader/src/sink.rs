use std::{fs, io::{BufReader, BufWriter, Write}, path::{Path, PathBuf}};

use crate::errors::SinkError;
use crate::types::FeatureRecord;

/// Writes labeled datasets as JSON arrays under one output directory
#[derive(Debug, Clone)]
pub struct DiskJsonSink {
    root: PathBuf
}

impl DiskJsonSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    /// Final path a dataset named `filename` lands at
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(Self::sanitize_name(filename))
    }

    /// Serializes `records` to `<root>/<filename>` through a temp file in
    /// the same directory, so readers never see a partial dataset.
    pub fn write_records(&self, filename: &str, records: &[FeatureRecord]) ->
        Result<PathBuf, SinkError> {

        let path = self.path_for(filename);
        fs::create_dir_all(&self.root)
            .map_err(|e| SinkError::io(self.root.display(), e))?;

        let temp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| SinkError::io(self.root.display(), e))?;

        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, records)?;
            writer.flush().map_err(|e| SinkError::io(temp.path().display(), e))?;
        }

        temp.persist(&path)
            .map_err(|e| SinkError::io(path.display(), e.error))?;

        Ok(path)
    }

    /// Loads a dataset written by `write_records`
    pub fn read_records(&self, filename: &str) -> Result<Vec<FeatureRecord>, SinkError> {
        let path = self.path_for(filename);
        let file = fs::File::open(&path)
            .map_err(|e| SinkError::io(path.display(), e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn sanitize_name(name: &str) -> String {
        let cleaned: String = name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        // no hidden files or parent hops
        match cleaned.trim_start_matches('.') {
            "" => "_".to_string(),
            rest if rest.len() != cleaned.len() => format!("_{rest}"),
            _ => cleaned
        }
    }
}
