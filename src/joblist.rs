//! Job list file: `{"jobs": [{"url": "https://example.com"}, ...]}`.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PoolError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

impl JobList {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let list: JobList = serde_json::from_reader(reader)?;
        list.validate()?;
        Ok(list)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn validate(&self) -> Result<()> {
        if let Some(pos) = self.jobs.iter().position(|j| j.url.trim().is_empty()) {
            return Err(PoolError::JobList(format!("job {} has an empty url", pos)));
        }
        Ok(())
    }

    /// Target URLs in file order.
    pub fn targets(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.url.trim().to_string()).collect()
    }
}
